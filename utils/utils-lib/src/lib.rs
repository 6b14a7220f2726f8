pub mod constants;
pub use constants::*;

pub mod tracing_telemetry;

pub mod macros {
    /// Returns the package description.
    #[macro_export]
    macro_rules! package_description {
        () => {
            env!("CARGO_PKG_DESCRIPTION")
        };
    }

    /// Print package related information.
    /// This includes the package name and version.
    #[macro_export]
    macro_rules! print_package_info {
        () => {
            println!(
                "{} version {}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
            )
        };
    }
}
