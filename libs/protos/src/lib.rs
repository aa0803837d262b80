//! Generated protobuf messages and gRPC stubs.
//!
//! Sources live under `proto/`; the checked-in code under `src/generated/`
//! is regenerated from them with `buf generate`.

pub mod liquidity {
    include!("generated/liquidity/liquidity.rs");
    include!("generated/liquidity/liquidity.tonic.rs");
}
