//! Renders a [`Source`] as a `<source>` XML element.
//!
//! Attribute values are single quoted and entity escaped, children are
//! indented by two spaces per level. Which attributes and children appear
//! mirrors which fields the locator parser populated.

use std::fmt::Write;

use quick_xml::escape::escape;
use sysdefs::storage::{HostTransport, StorageType};

use crate::source::{Host, Source};

const INDENT: &str = "  ";

#[derive(Debug, Default)]
struct Element {
    name: &'static str,
    attributes: Vec<(&'static str, String)>,
    children: Vec<Element>,
    text: Option<String>,
}

impl Element {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    fn attr(mut self, key: &'static str, value: impl ToString) -> Self {
        self.attributes.push((key, value.to_string()));
        self
    }

    fn opt_attr(self, key: &'static str, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.attr(key, value),
            None => self,
        }
    }

    fn child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    fn render(&self, depth: usize, out: &mut String) {
        let indent = INDENT.repeat(depth);
        let _ = write!(out, "{indent}<{}", self.name);
        for (key, value) in &self.attributes {
            let _ = write!(out, " {key}='{}'", escape(value.as_str()));
        }

        if let Some(text) = &self.text {
            let _ = writeln!(out, ">{}</{}>", escape(text.as_str()), self.name);
        } else if self.children.is_empty() {
            out.push_str("/>\n");
        } else {
            out.push_str(">\n");
            for child in &self.children {
                child.render(depth + 1, out);
            }
            let _ = writeln!(out, "{indent}</{}>", self.name);
        }
    }
}

fn host_element(host: &Host) -> Element {
    let element = Element::new("host");
    let element = match host.transport {
        HostTransport::Tcp => element,
        transport => element.attr("transport", transport),
    };

    element
        .opt_attr("name", host.name.as_deref())
        .opt_attr("port", host.port)
        .opt_attr("socket", host.socket.as_deref())
}

fn source_element(source: &Source) -> Element {
    let path = source.path.as_ref().map(|path| path.display());
    let mut element = Element::new("source");

    match source.kind {
        StorageType::File => element = element.opt_attr("file", path),
        StorageType::Block => element = element.opt_attr("dev", path),
        StorageType::Dir => element = element.opt_attr("dir", path),
        StorageType::Network => {
            element = element
                .attr("protocol", source.protocol)
                .opt_attr("name", source.name.as_deref())
                .opt_attr("query", source.query.as_deref());

            for host in &source.hosts {
                element = element.child(host_element(host));
            }

            if let Some(snapshot) = &source.snapshot {
                element = element.child(Element::new("snapshot").attr("name", snapshot));
            }

            if let Some(config) = &source.config_file {
                element = element.child(Element::new("config").attr("file", config.display()));
            }

            if let Some(verify) = source.ssl_verify {
                element = element
                    .child(Element::new("ssl").attr("verify", if verify { "yes" } else { "no" }));
            }

            if !source.cookies.is_empty() {
                element = element.child(source.cookies.iter().fold(
                    Element::new("cookies"),
                    |cookies, cookie| {
                        cookies.child(
                            Element::new("cookie")
                                .attr("name", &cookie.name)
                                .text(cookie.value.as_str()),
                        )
                    },
                ));
            }

            if let Some(timeout) = source.timeout_seconds {
                element = element.child(Element::new("timeout").attr("seconds", timeout));
            }

            if let Some(identity) = &source.nfs_identity {
                element = element.child(
                    Element::new("identity")
                        .attr("user", &identity.user)
                        .attr("group", &identity.group),
                );
            }
        }
        StorageType::Nvme => {
            element = element.attr("type", "pci");
            if let Some(nvme) = &source.nvme {
                let address = nvme.address;
                element = element.attr("namespace", nvme.namespace).child(
                    Element::new("address")
                        .attr("domain", format!("0x{:04x}", address.domain))
                        .attr("bus", format!("0x{:02x}", address.bus))
                        .attr("slot", format!("0x{:02x}", address.slot))
                        .attr("function", format!("0x{:x}", address.function)),
                );
            }
        }
        StorageType::None => {}
    }

    if let Some(slice) = source.slice {
        element = element.child(
            Element::new("slices").child(
                Element::new("slice")
                    .attr("type", "storage")
                    .attr("offset", slice.offset)
                    .attr("size", slice.size),
            ),
        );
    }

    element
}

/// Formats the `<source>` element describing `source`. The backing store is
/// not included.
pub fn format_source(source: &Source) -> String {
    let mut out = String::new();
    source_element(source).render(0, &mut out);
    out
}
