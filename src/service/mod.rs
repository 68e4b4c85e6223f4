//! Run orchestration service.
//!
//! ## Overview
//!
//! The service learns reusable workflow patterns from successful runs of
//! an external code-generation CLI and injects them back into future runs.
//! A client submits an instruction against a project; the orchestrator
//! provisions an isolated workspace, composes a system prompt from a
//! cached pattern block, drives the planner (whose only tool shells out to
//! the CLI), persists the streamed JSONL as steps and artifacts, extracts
//! a compact pattern from the transcript, and exposes progress over SSE.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)        │
//! │          │ <─────── │    └─ api.rs  (route handlers, AppState)       │
//! └──────────┘   SSE    │         │                                      │
//!                       │         │ RunService::create_run()             │
//!                       │         v                                      │
//!                       │  run_service.rs  (lifecycle state machine)     │
//!                       │    │ workspace.rs   (sandbox, diff summary)    │
//!                       │    │ planner.rs     (upstream / synthetic)     │
//!                       │    v                                           │
//!                       │  codex.rs  (exec primitive, CancelRegistry)    │
//!                       └────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                        |
//! |-------------|-------------------------------------------------------|
//! | `models`    | Shared types: `Run`, `Step`, `Artifact`, enums        |
//! | `db`        | `Store`: guarded SQLite plus a blocking-pool bridge   |
//! | `events`    | `EventBroker` + `RunEvent`, per-run fan-out           |
//! | `summary`   | Deterministic machine summary of terminal runs        |

pub mod api;
pub mod codex;
pub mod db;
pub mod events;
pub mod models;
pub mod planner;
pub mod run_service;
pub mod server;
pub mod summary;
pub mod workspace;
