pub mod condition;
pub mod native;
pub mod registry;
pub mod sequential;

pub use condition::evaluate_condition;
pub use native::NativeNavigator;
pub use registry::NavigatorRegistry;
pub use sequential::SequentialNavigator;
