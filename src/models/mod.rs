pub mod family;
pub mod identity;
pub mod profile;
pub mod user_view;

pub use family::*;
pub use identity::*;
pub use profile::*;
pub use user_view::*;
