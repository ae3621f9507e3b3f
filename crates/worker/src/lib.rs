pub mod processor;


pub use processor::{RequestProcessor, RequestProcessorBuilder};
