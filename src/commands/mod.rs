pub mod call_api;

pub use call_api::CallFacade;
