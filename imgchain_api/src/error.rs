use std::fmt::{Debug, Write};
use std::path::PathBuf;
use std::{borrow::Cow, panic::Location};

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;
use sysdefs::storage::NetProtocol;

/// A backing locator could not be turned into a source description.
#[derive(Debug, Clone, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ParseError {
    #[error("Invalid backing protocol '{protocol}'")]
    InvalidProtocol { protocol: String },
    #[error("Invalid protocol transport type '{transport}'")]
    InvalidTransport { transport: String },
    #[error("Failed to parse backing file location '{uri}'")]
    MalformedUri { uri: String },
    #[error("Malformed nbd string '{locator}'")]
    MalformedNbd { locator: String },
    #[error("Malformed rbd string '{locator}'")]
    MalformedRbd { locator: String },
    #[error("Malformed sheepdog string '{locator}'")]
    MalformedSheepdog { locator: String },
    #[error("Malformed backing store path for protocol {protocol}")]
    MalformedProtocolString { protocol: NetProtocol },
    #[error("Invalid port '{port}'")]
    InvalidPort { port: String },
    #[error("Missing volume name or file name in gluster source path '{path}'")]
    MalformedGlusterPath { path: String },
    #[error("Failed to parse JSON backing definition: {reason}")]
    MalformedJson { reason: String },
    #[error("JSON backing definition is not an object")]
    JsonNotObject,
    #[error("Cannot expand dotted key '{key}' in JSON backing definition")]
    DeflattenConflict { key: String },
    #[error("JSON backing definition lacks 'file' object")]
    MissingFileObject,
    #[error("JSON backing definition lacks driver name")]
    MissingDriver,
    #[error("Missing parser implementation for JSON backing volume driver '{driver}'")]
    UnknownDriver { driver: String },
    #[error("JSON backing definition must not have nested format driver '{driver}'")]
    NestedFormatDriver { driver: String },
    #[error("Missing '{field}' field in JSON backing definition for driver '{driver}'")]
    MissingField { driver: String, field: String },
    #[error("Malformed '{field}' field in JSON backing definition for driver '{driver}'")]
    MalformedField { driver: String, field: String },
    #[error("Expected protocol '{expected}' but got '{actual}' in URI JSON volume definition")]
    ProtocolMismatch {
        expected: NetProtocol,
        actual: NetProtocol,
    },
    #[error("Only TCP transport is supported for {driver} volumes, got '{transport}'")]
    UnsupportedTransport { driver: String, transport: String },
    #[error("Backing store socket type '{socket_type}' is not supported")]
    UnsupportedSocketType { socket_type: String },
    #[error("Malformed http cookie '{cookie}'")]
    MalformedCookie { cookie: String },
    #[error("Malformed PCI address '{address}', expected 'DDDD:BB:SS.F'")]
    MalformedPciAddress { address: String },
}

/// Building a backing chain failed. No partial chain is returned.
#[derive(Debug, Clone, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ChainError {
    #[error("Backing store for '{path}' is self-referential")]
    Loop { path: PathBuf },
    #[error("Backing chain of '{path}' is nested deeper than {max_depth} images")]
    TooDeep { path: PathBuf, max_depth: usize },
    #[error("Failed to resolve backing image '{locator}'")]
    Unresolvable { locator: String },
}

#[derive(Debug, Clone, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum RelativePathError {
    #[error("Failed to resolve relative backing name: base image is not in backing chain")]
    NotInChain,
}

#[derive(Debug, Clone, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum ConfigError {
    #[error("Failed to load configuration file from '{path}'")]
    Load { path: String },
    #[error("Failed to parse configuration file")]
    Parse,
    #[error("Maximum chain depth must be at least 1")]
    InvalidMaxDepth,
}

#[derive(Debug, Clone, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidInputError {
    #[error("No image named '{name}' in the backing chain")]
    UnknownImage { name: String },
}

#[derive(Debug, Clone, Eq, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub enum InternalError {
    #[error("Failed to serialize backing chain")]
    SerializeChain,
}

/// Category of an [`ImgChainError`]. Serializes as the wrapped error.
#[derive(Debug, Eq, thiserror::Error, IntoStaticStr, PartialEq, Serialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(untagged)]
pub enum ErrorKind {
    /// A backing locator was malformed or unsupported.
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A backing chain could not be built.
    #[error(transparent)]
    Chain(#[from] ChainError),

    /// A relative path between two chain members could not be computed.
    #[error(transparent)]
    RelativePath(#[from] RelativePathError),

    /// The configuration file was unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// User provided input did not match the chain.
    #[error(transparent)]
    InvalidInput(#[from] InvalidInputError),

    /// Unexpected failure inside imgchain.
    #[error(transparent)]
    Internal(#[from] InternalError),
}

type Site = &'static Location<'static>;

fn site(location: Site) -> String {
    format!("{}:{}", location.file(), location.line())
}

#[derive(Debug)]
struct Inner {
    kind: ErrorKind,
    location: Site,
    cause: Option<anyhow::Error>,
    context: Vec<(Cow<'static, str>, Site)>,
}

/// Error returned by every chain operation: a categorized [`ErrorKind`],
/// where it was raised, what caused it and the messages attached on the way
/// up.
pub struct ImgChainError(Box<Inner>);

impl ImgChainError {
    #[track_caller]
    pub fn new(kind: impl Into<ErrorKind>) -> Self {
        Self::raise(kind.into(), None, Location::caller())
    }

    fn raise(kind: ErrorKind, cause: Option<anyhow::Error>, location: Site) -> Self {
        ImgChainError(Box::new(Inner {
            kind,
            location,
            cause,
            context: Vec::new(),
        }))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.0.kind
    }
}

impl From<ParseError> for ImgChainError {
    #[track_caller]
    fn from(error: ParseError) -> Self {
        Self::raise(error.into(), None, Location::caller())
    }
}

pub trait ReportError<T, K> {
    /// Turns a missing value or a foreign error into an [`ImgChainError`] of
    /// the given kind, keeping the foreign error as its cause.
    fn structured(self, kind: K) -> Result<T, ImgChainError>;
}

impl<T, K> ReportError<T, K> for Option<T>
where
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, ImgChainError> {
        let location = Location::caller();
        self.ok_or_else(|| ImgChainError::raise(kind.into(), None, location))
    }
}

impl<T, E, K> ReportError<T, K> for Result<T, E>
where
    E: Into<anyhow::Error>,
    K: Into<ErrorKind>,
{
    #[track_caller]
    fn structured(self, kind: K) -> Result<T, ImgChainError> {
        let location = Location::caller();
        self.map_err(|e| ImgChainError::raise(kind.into(), Some(e.into()), location))
    }
}

pub trait ImgChainResultExt<T> {
    /// Attaches a message describing what was being done.
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, ImgChainError>;
}

impl<T> ImgChainResultExt<T> for Result<T, ImgChainError> {
    #[track_caller]
    fn message(self, context: impl Into<Cow<'static, str>>) -> Result<T, ImgChainError> {
        let location = Location::caller();
        self.map_err(|mut e| {
            e.0.context.push((context.into(), location));
            e
        })
    }
}

/// Shape of the YAML error report.
#[derive(Serialize)]
#[serde(rename = "imgchain-error")]
struct Report<'a> {
    message: String,
    error: &'a ErrorKind,
    category: &'static str,
    location: String,
    cause: Option<String>,
}

impl Serialize for ImgChainError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        Report {
            message: self.0.kind.to_string(),
            error: &self.0.kind,
            category: (&self.0.kind).into(),
            location: site(self.0.location),
            cause: self.0.cause.as_ref().map(|cause| format!("{cause:?}")),
        }
        .serialize(serializer)
    }
}

impl Debug for ImgChainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at {}", self.0.kind, site(self.0.location))?;

        if !self.0.context.is_empty() {
            f.write_str("\n\nContext:\n")?;
            for (i, (message, location)) in self.0.context.iter().enumerate() {
                writeln!(f, "{i:>5}: {message} at {}", site(*location))?;
            }
        }

        let Some(cause) = &self.0.cause else {
            return Ok(());
        };

        f.write_str("\n\nCaused by:\n")?;
        for (i, error) in cause.chain().enumerate() {
            let text = error.to_string();
            let mut lines = text.split('\n');
            write!(f, "{i:>5}: {}", lines.next().unwrap_or_default())?;
            for line in lines {
                write!(f, "\n       {line}")?;
            }
            f.write_char('\n')?;
        }
        Ok(())
    }
}
