pub mod command_fault;
pub mod fan_out;

pub use command_fault::CommandFaultTaskHelper;
pub use fan_out::FanOutTaskHelper;
