//! # deployd
//!
//! A self-hosted deployment control plane.
//!
//! deployd is a small authenticated web service that stores named deployment
//! configurations — each tied to a Git repository, an optional Jenkins job,
//! an optional BigBoat dashboard, host services, and secret material — and
//! runs a reproducible update pipeline for any of them on demand.
//!
//! ## Pipeline
//!
//! A deployment update runs on its own worker thread and performs, in order:
//!
//! 1. [`deployment::Deployment::check_ci`] verifies that the latest Jenkins
//!    build for the tracked branch is complete, accepted, and fresh against
//!    the upstream repository.
//! 2. [`git::refresh`] brings the local working copy up to date with the
//!    upstream branch, authenticating with the deployment's deploy key.
//! 3. Build artifacts are copied into the working copy (opt-in).
//! 4. Operator-supplied secret files are written into the working copy.
//! 5. The install script runs inside the working copy.
//! 6. Host services are restarted in order.
//! 7. New compose files are published to the BigBoat dashboard when they
//!    changed between the previous and current working-copy heads.
//!
//! Progress is published through a [`task::ProgressSink`] at every phase
//! boundary; the [`supervisor::TaskSupervisor`] captures the latest record
//! per deployment, enforces single-flight admission, and joins all workers
//! on shutdown. The [`web`] module exposes the whole thing over HTTP.

pub mod auth;
pub mod bigboat;
pub mod deployment;
pub mod error;
pub mod fields;
pub mod git;
pub mod jenkins;
pub mod keys;
pub mod store;
pub mod supervisor;
pub mod task;
pub mod templates;
pub mod web;
