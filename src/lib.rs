pub mod cli;
pub mod connection;
pub mod logging;
pub mod network;
pub mod orchestrator;
pub mod parser;
pub mod resolver;
pub mod robots;
pub mod url_utils;

// Re-export main types for library usage
pub use connection::{Connection, LookupQueue};
pub use network::{ClientConfig, FetchError, Roundtrip};
pub use orchestrator::{
    measure_max_connections, MeasureConfig, MeasureReport, Orchestrator, Termination,
};
pub use parser::scrap_html;
pub use resolver::ResolvedUrl;
pub use robots::RobotsRules;
pub use url_utils::RelativeUrl;
