pub mod decrypt;
pub mod error;
pub mod fetch;
pub mod hls;
pub mod merge;
pub mod metadata;
pub mod pipeline;
pub mod rpc;
pub mod session;

pub use error::{DestreamError, DestreamResult};
