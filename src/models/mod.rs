pub mod call;
pub mod user;

pub use call::*;
pub use user::*;
