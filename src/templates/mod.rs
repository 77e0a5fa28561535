pub mod cache;
pub mod dedup;
pub mod namer;
pub mod poller;
pub mod validator;
