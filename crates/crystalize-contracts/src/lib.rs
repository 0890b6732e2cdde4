pub mod density;
pub mod events;
pub mod palette;
pub mod session;
