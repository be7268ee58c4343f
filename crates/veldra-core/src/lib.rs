// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Veldra Core - Durable Step-Function Executor
//!
//! This crate drives user functions - sequences of opcode-emitting steps
//! served by remote SDKs - through a persistent state store and a reliable
//! job queue. It schedules runs from events or batches, dispatches steps to
//! pluggable runtime drivers, interprets the opcode protocol those drivers
//! return, and matches asynchronous events against saved pauses to resume
//! sleeping, waiting, or invoking runs.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Event ingress                          │
//! │        (schedule requests, event matching, batches)           │
//! └──────────────────────────────────────────────────────────────┘
//!         │ Schedule              │ HandlePauses / HandleInvokeFinish
//!         ▼                       ▼
//! ┌───────────────┐      ┌────────────────┐
//! │   Scheduler   │      │  Pause Engine  │
//! └───────────────┘      └────────────────┘
//!         │ enqueue                │ resume / cancel
//!         ▼                        ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Step Executor                            │
//! │  load state → validate → select driver → normalize response   │
//! └──────────────────────────────────────────────────────────────┘
//!         │ opcodes
//!         ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Opcode Interpreter                          │
//! │  step / step-error / planned / sleep / wait / invoke / none   │
//! └──────────────────────────────────────────────────────────────┘
//!      │                  │                     │
//!      ▼                  ▼                     ▼
//! ┌──────────┐      ┌───────────┐      ┌──────────────────┐
//! │  Queue   │      │ StateStore│      │ Runtime Drivers  │
//! └──────────┘      └───────────┘      └──────────────────┘
//! ```
//!
//! # Correctness model
//!
//! The executor is reentrant and safe for concurrent calls across runs.
//! Per-run correctness under retries rests on idempotent writes at every
//! boundary:
//!
//! - deterministic pause ids (UUIDv5 over `run_id + step_id`), so re-issuing
//!   a pause is a no-op;
//! - queue job ids derived from `idempotency_key + step_id`, so duplicate
//!   enqueues collapse;
//! - single-shot `started_at`/`span_id` metadata writes enforced by the
//!   state store;
//! - pause leasing, so exactly one concurrent matcher consumes a pause.
//!
//! The queue substrate, state store, drivers, expression aggregator,
//! batcher, and debouncer are external collaborators expressed as traits;
//! in-memory reference backends ship for tests and embedding.

pub mod batch;
pub mod config;
pub mod debounce;
pub mod driver;
pub mod error;
pub mod event;
pub mod executor;
pub mod expr;
pub mod lifecycle;
pub mod queue;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use executor::{
    CancelRequest, Cancellation, CancellationChecker, Executor, ExecutorBuilder, FinishHandler,
    FunctionLoader, HandlePauseResult, InvokeNotFoundHandler, InvokeNotFoundOpts, ResumeRequest,
    ScheduleRequest, SendEventHandler, SkipState,
};
pub use lifecycle::LifecycleListener;
