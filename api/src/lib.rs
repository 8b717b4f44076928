pub mod fanout;
pub mod placeholder;
pub mod routes;
