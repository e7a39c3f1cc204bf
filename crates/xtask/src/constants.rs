/// Embedded target the `no_std` crates are cross-checked against.
pub const TARGET: &str = "thumbv7em-none-eabihf";

/// Crates that make up the bus stack. All of them are `no_std`.
pub const PACKAGES: [&str; 2] = ["spb", "spb-loopback"];
