// Test modules

pub mod common;

mod correlation_service_test;
mod rca_agent_test;
mod report_service_test;
mod webhook_service_test;
