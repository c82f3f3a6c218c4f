//! Operator commands for inspecting and exercising queue admission state.
//!
//! Shared by the `slotgatectl` binary and tests. SlateDB admits one writer per
//! path, so point `slotgatectl` at a store no daemon currently holds open.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::admission::{Admission, AdmissionEngine};
use crate::clock::{Clock, SystemClock};
use crate::counter_store::{CounterStore, CounterStoreError};
use crate::factory::{OpenedStore, build_engine, open_counter_store};
use crate::keys::{cursor_key, hour_counter_key, minute_counter_key};
use crate::settings::{AppConfig, QueueTable};
use crate::slot::{SlotKey, slot_of};

/// Options that apply to every command.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    /// Output JSON instead of plain text
    pub json: bool,
}

/// Everything a command needs, opened once per invocation.
pub struct CtlContext {
    pub config: AppConfig,
    pub opened: OpenedStore,
    pub engine: AdmissionEngine,
    pub clock: Arc<dyn Clock>,
}

impl CtlContext {
    pub async fn open(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = AppConfig::load(config_path)?;
        Self::from_config(config, SystemClock::new_arc()).await
    }

    pub async fn from_config(config: AppConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let opened = open_counter_store(&config.store, Arc::clone(&clock)).await?;
        let engine = build_engine(&config, Arc::clone(&opened.store), None);
        Ok(Self {
            config,
            opened,
            engine,
            clock,
        })
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        self.opened.close().await?;
        Ok(())
    }
}

/// Counter state of one queue around the current slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub queue: String,
    pub now_ms: i64,
    pub current_slot: SlotKey,
    pub current_slot_label: String,
    pub minute_count: i64,
    pub minute_limit: i64,
    pub hour_count: i64,
    pub hour_limit: i64,
    pub cursor: Option<SlotKey>,
}

pub async fn queue_snapshot(
    store: &dyn CounterStore,
    queues: &QueueTable,
    queue: &str,
    now_ms: i64,
) -> Result<QueueSnapshot, CounterStoreError> {
    let limits = queues.limits_for(queue);
    let current = slot_of(now_ms);
    let minute_count = store
        .get(&minute_counter_key(queue, current))
        .await?
        .unwrap_or(0);
    let hour_count = store
        .get(&hour_counter_key(queue, current.hour()))
        .await?
        .unwrap_or(0);
    let cursor = store
        .get(&cursor_key(queue))
        .await?
        .map(SlotKey::from_epoch_minutes);
    Ok(QueueSnapshot {
        queue: queue.to_string(),
        now_ms,
        current_slot: current,
        current_slot_label: current.calendar_label(),
        minute_count,
        minute_limit: limits.minute_limit,
        hour_count,
        hour_limit: limits.hour_limit,
        cursor,
    })
}

/// Print the queue's current counters and cursor.
pub async fn inspect<W: Write>(
    ctx: &CtlContext,
    queue: &str,
    opts: &GlobalOptions,
    out: &mut W,
) -> anyhow::Result<()> {
    let snapshot = queue_snapshot(
        ctx.opened.store.as_ref(),
        ctx.engine.queues(),
        queue,
        ctx.clock.now_ms(),
    )
    .await?;
    if opts.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&snapshot)?)?;
        return Ok(());
    }
    writeln!(out, "Queue:        {}", snapshot.queue)?;
    writeln!(out, "Slot:         {}", snapshot.current_slot)?;
    writeln!(
        out,
        "Minute usage: {}/{}",
        snapshot.minute_count, snapshot.minute_limit
    )?;
    writeln!(
        out,
        "Hour usage:   {}/{}",
        snapshot.hour_count, snapshot.hour_limit
    )?;
    match snapshot.cursor {
        Some(cursor) => writeln!(out, "Cursor:       {}", cursor)?,
        None => writeln!(out, "Cursor:       (unset)")?,
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct AdmitReport {
    queue: String,
    decision: &'static str,
    slot: Option<SlotKey>,
    reserved: bool,
}

/// Run one admission check, consuming capacity exactly as a real job would.
pub async fn admit<W: Write>(
    ctx: &CtlContext,
    queue: &str,
    opts: &GlobalOptions,
    out: &mut W,
) -> anyhow::Result<()> {
    let admission = ctx.engine.check(queue, ctx.clock.now_ms(), None).await?;
    let report = match admission {
        Admission::Admitted { .. } => AdmitReport {
            queue: queue.to_string(),
            decision: "admitted",
            slot: None,
            reserved: false,
        },
        Admission::Deferred { slot, reserved } => AdmitReport {
            queue: queue.to_string(),
            decision: "deferred",
            slot: Some(slot),
            reserved,
        },
    };
    if opts.json {
        writeln!(out, "{}", serde_json::to_string_pretty(&report)?)?;
    } else {
        match report.slot {
            Some(slot) => writeln!(
                out,
                "{}: deferred to {}{}",
                queue,
                slot,
                if report.reserved { "" } else { " (not reserved)" }
            )?,
            None => writeln!(out, "{}: admitted", queue)?,
        }
    }
    Ok(())
}

/// Reserve a future slot directly, bypassing the current-slot check.
pub async fn allocate<W: Write>(
    ctx: &CtlContext,
    queue: &str,
    opts: &GlobalOptions,
    out: &mut W,
) -> anyhow::Result<()> {
    let limits = ctx.engine.queues().limits_for(queue);
    let allocation = ctx
        .engine
        .allocator()
        .allocate(queue, limits, ctx.clock.now_ms())
        .await?;
    if opts.json {
        let value = serde_json::json!({
            "queue": queue,
            "slot": allocation.slot,
            "slot_label": allocation.slot.calendar_label(),
            "reserved": allocation.reserved,
            "scanned": allocation.scanned,
        });
        writeln!(out, "{}", serde_json::to_string_pretty(&value)?)?;
    } else {
        writeln!(
            out,
            "{}: {} {} after scanning {} slot(s)",
            queue,
            if allocation.reserved {
                "reserved"
            } else {
                "no capacity, furthest"
            },
            allocation.slot,
            allocation.scanned
        )?;
    }
    Ok(())
}
