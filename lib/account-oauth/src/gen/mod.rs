//! Checked-in protobuf bindings, regenerate from `proto/` with tonic-build

#[allow(clippy::all)]
pub mod githuboauth;
