pub mod exe;
pub mod files;
pub mod image_header;
pub mod path;
pub mod qemu_img;

#[cfg(any(test, feature = "test-utilities"))]
pub mod testutils;

pub(crate) mod crate_private {
    pub trait Sealed {}
}
