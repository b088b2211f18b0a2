//! Use-case layer of the library service.

pub mod service;

pub use service::LibraryService;
