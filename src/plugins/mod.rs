pub mod epub;
pub mod fb2;
pub mod lib_social;
pub mod pdf;
pub mod registry;
pub mod xml;
