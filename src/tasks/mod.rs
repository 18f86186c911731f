//! Asynchronous task execution: the [`TaskHub`] records tasks and their
//! history, the [`Worker`] runs them one at a time per project.

pub mod hub;
pub mod worker;

pub use hub::TaskHub;
pub use worker::{TaskDispatcher, Worker};
