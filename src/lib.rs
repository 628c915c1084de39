pub mod app;
pub mod archive;
pub mod config;
pub mod domain;
pub mod error;
pub mod extract;
pub mod filter;
pub mod fs_util;
pub mod ledger;
pub mod output;
pub mod pacs;
pub mod query;
pub mod reader;
pub mod scan;
pub mod store;
pub mod table;
