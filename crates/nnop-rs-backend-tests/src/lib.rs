pub mod conformance;
pub mod fixtures;
pub mod recording;

pub use anyhow;
pub use recording::{Invocation, RecordingTable};

/// Installs a test-writer subscriber once; `RUST_LOG` selects the level (default `warn`).
pub fn init_test_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Instantiates the conformance suite for a registry constructor returning
/// `Arc<KernelRegistry>`.
#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $registry_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            use $crate::conformance;

            macro_rules! conformance_test {
                ($name:ident) => {
                    #[test]
                    fn $name() -> $crate::anyhow::Result<()> {
                        $crate::init_test_logging();
                        let registry = ($registry_ctor)();
                        conformance::$name(&registry)
                    }
                };
            }

            conformance_test!(every_advertised_pair_binds);
            conformance_test!(conv2d_f32_matches_reference);
            conformance_test!(conv2d_i8_pointwise_matches_reference);
            conformance_test!(conv2d_i8_odd_channels_matches_reference);
            conformance_test!(conv2d_relu_i8_matches_reference);
            conformance_test!(grouped_conv2d_matches_reference);
            conformance_test!(depthwise_i8_matches_reference);
            conformance_test!(depthwise_f32_large_kernel_matches_reference);
            conformance_test!(fully_connected_matches_reference);
            conformance_test!(elementwise_ops_match_reference);
            conformance_test!(max_pool_matches_reference);
            conformance_test!(rescaled_activations_track_float);
            conformance_test!(chained_graph_matches_reference);
            conformance_test!(execution_follows_declaration_order);
        }
    };
}
