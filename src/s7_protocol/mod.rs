pub(crate) mod address;
pub mod codec;
pub(crate) mod header;
pub(crate) mod read_area;
pub(crate) mod response;
pub(crate) mod types;
pub(crate) mod write_area;
