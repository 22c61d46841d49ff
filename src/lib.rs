pub mod app;
pub mod batch;
pub mod config;
pub mod dataset;
pub mod domain;
pub mod error;
pub mod executor;
pub mod lister;
pub mod merge;
pub mod normalize;
pub mod output;
pub mod pool;
pub mod reader;
pub mod storage;
pub mod store;
pub mod zarr;
