pub mod location;
pub mod route;
