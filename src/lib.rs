//! # Mission Sync
//!
//! Client-side state engine for the mission-control app.
//!
//! This library provides:
//! - A registry of mission entities published as immutable snapshots
//! - A command executor that applies optimistic changes and rolls them back
//! - A reconciler that folds backend notifications into the registry
//! - Derived list and statistics views for presentation code
//!
//! ## Architecture
//!
//! 1. UI actions call into [`executor::CommandExecutor`]
//! 2. The executor mutates the [`registry::MissionRegistry`] optimistically
//!    and sends the command over an [`backend::EventChannel`]
//! 3. On completion it confirms or rolls back
//! 4. [`reconciler::EventReconciler`] applies backend-pushed notifications
//!    to the same registry
//! 5. [`views`] recompute from the published snapshots
//!
//! ## Example
//!
//! ```rust,ignore
//! use mission_sync::{CommandExecutor, EventReconciler, MissionRegistry, SyncConfig};
//!
//! let registry = MissionRegistry::new();
//! let executor = CommandExecutor::new(registry.clone(), channel.clone(), SyncConfig::from_env()?);
//! let reconciler = EventReconciler::new(registry.clone());
//! let events = channel.subscribe();
//! tokio::spawn(async move { reconciler.run(events, cancel).await });
//! executor.refresh(Default::default()).await?;
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod mission;
pub mod reconciler;
pub mod registry;
pub mod replay;
pub mod views;

pub use config::SyncConfig;
pub use error::{BackendError, SyncError};
pub use executor::{CommandExecutor, ControlOutcome};
pub use mission::{Mission, MissionId, MissionRecord, MissionState};
pub use reconciler::EventReconciler;
pub use registry::MissionRegistry;
