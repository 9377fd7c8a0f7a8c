pub mod haier;
pub mod matter;
