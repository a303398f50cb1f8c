pub mod backend;
pub mod conversation;
pub mod dashboard;
pub mod logging;
pub mod model;
pub mod realtime;
pub mod roster;
pub mod session;
pub mod storage;
pub mod web_client;
