pub mod aggregate;
pub mod cli;
pub mod config;
pub mod driver;
pub mod error;
pub mod export;
pub mod logging;
pub mod model;
pub mod parsers;
pub mod probe;
pub mod report;
pub mod supervisor;
pub mod workload;
