pub mod archiver;
pub mod bag;
pub mod catalog;
pub mod jobs;
pub mod packer;
pub mod retrieval;
pub mod splitter;
pub mod tape;
pub mod transport;
