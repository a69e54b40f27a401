pub mod alert;
pub mod alertmanager;
pub mod incident;
pub mod rca_report;

pub use alert::*;
pub use alertmanager::*;
pub use incident::*;
pub use rca_report::*;
