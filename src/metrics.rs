//! trunkline runtime metrics.
//!
//! Counters for connection lifecycle, call dispatch, and reactor task
//! traffic. Registered with metriken for exposition by whatever admin
//! surface the embedding process runs.

use metriken::{Counter, Gauge, metric};

// ── Connection lifecycle ─────────────────────────────────────────

#[metric(
    name = "trunkline/connections/accepted",
    description = "Inbound connections registered with a reactor"
)]
pub static CONNECTIONS_ACCEPTED: Counter = Counter::new();

#[metric(
    name = "trunkline/connections/dialed",
    description = "Outbound connections created by find-or-start"
)]
pub static CONNECTIONS_DIALED: Counter = Counter::new();

#[metric(
    name = "trunkline/connections/destroyed",
    description = "Connections torn down individually (not by reactor shutdown)"
)]
pub static CONNECTIONS_DESTROYED: Counter = Counter::new();

#[metric(
    name = "trunkline/connections/active",
    description = "Connections currently held in reactor tables"
)]
pub static CONNECTIONS_ACTIVE: Gauge = Gauge::new();

#[metric(
    name = "trunkline/connections/idle_timeouts",
    description = "Inbound connections reaped by the idle scanner"
)]
pub static CONNECTIONS_IDLE_TIMEOUT: Counter = Counter::new();

// ── Negotiation ──────────────────────────────────────────────────

#[metric(
    name = "trunkline/negotiation/failures",
    description = "Connection negotiations that completed with an error"
)]
pub static NEGOTIATION_FAILURES: Counter = Counter::new();

#[metric(
    name = "trunkline/negotiation/timeouts",
    description = "Connections destroyed by the negotiation deadline watchdog"
)]
pub static NEGOTIATION_TIMEOUTS: Counter = Counter::new();

// ── Calls ────────────────────────────────────────────────────────

#[metric(
    name = "trunkline/calls/queued",
    description = "Outbound calls accepted into a reactor's queue"
)]
pub static CALLS_QUEUED: Counter = Counter::new();

#[metric(
    name = "trunkline/calls/aborted",
    description = "Outbound calls terminated without delivery"
)]
pub static CALLS_ABORTED: Counter = Counter::new();

// ── Reactor tasks ────────────────────────────────────────────────

#[metric(
    name = "trunkline/tasks/scheduled",
    description = "Tasks accepted onto a reactor's pending queue"
)]
pub static TASKS_SCHEDULED: Counter = Counter::new();

#[metric(
    name = "trunkline/tasks/aborted",
    description = "Tasks finalized via abort instead of run"
)]
pub static TASKS_ABORTED: Counter = Counter::new();
