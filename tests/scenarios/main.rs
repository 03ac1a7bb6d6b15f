//! End-to-end pipeline scenarios driven by a scripted runner

mod helpers;

mod artifacts;
mod environments;
mod manual_gates;
mod retry_behavior;
mod stage_ordering;
mod trigger_rules;
