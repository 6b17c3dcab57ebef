pub mod common;
pub mod jobs;
pub mod stac;
pub mod worker;

pub use common::{ListResponse, PageQuery};
