//! Network condition toolkit for the streaming experiments.
//!
//! Provides the [`LinkShaper`](impairment::LinkShaper) capability with a
//! `tc netem` implementation, cross-traffic generation with `iperf3`, and an
//! in-process [`EmulatedLink`](emulated::EmulatedLink) that stands in for
//! both when a scenario runs without a real emulated topology.

pub mod cross_traffic;
pub mod emulated;
pub mod impairment;
pub mod topology;

pub mod test_util;
