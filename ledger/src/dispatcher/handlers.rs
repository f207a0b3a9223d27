//! Per-event deltas. Each handler runs after the pool has been advanced and
//! validates everything before its first collaborator call.

use alloy_primitives::Address;
use tracing::{debug, error, info, instrument, warn};

use super::ledger::Staged;
use super::{Dispatcher, Envelope, Event, EventOutcome};
use crate::collaborators::{Keeper, StreamingProtocol, TaskId, YieldSource};
use crate::error::{LedgerError, NOT_ENOUGH_BALANCE, NOT_ENOUGH_LIQUIDITY};
use crate::math::{self, Fixed, MathError, SignedRate};
use crate::outflow::{self, StepDecision, StepPlan};
use crate::participant::{OutStream, ParticipantState};

const INBOUND: &str = "inbound";
const OUTBOUND: &str = "outbound";

fn require_amount(amount: u128) -> Result<u128, LedgerError> {
    if amount == 0 {
        return Err(LedgerError::InvalidAmount);
    }
    Ok(amount)
}

fn require_rate(rate: SignedRate) -> Result<SignedRate, LedgerError> {
    if rate <= 0 {
        return Err(LedgerError::InvalidRate(rate));
    }
    Ok(rate)
}

/// `amount` rounded down to a multiple of `unit`.
fn floor_to(amount: u128, unit: u128) -> u128 {
    amount - amount % unit.max(1)
}

/// `amount` rounded up to a multiple of `unit`, saturating.
fn ceil_to(amount: u128, unit: u128) -> u128 {
    let floor = floor_to(amount, unit);
    if floor == amount {
        amount
    } else {
        floor.saturating_add(unit)
    }
}

fn add_rate(a: SignedRate, b: SignedRate, ctx: &'static str) -> Result<SignedRate, LedgerError> {
    Ok(a.checked_add(b).ok_or(MathError::Overflow(ctx))?)
}

fn sub_rate(a: SignedRate, b: SignedRate, ctx: &'static str) -> Result<SignedRate, LedgerError> {
    Ok(a.checked_sub(b).ok_or(MathError::Underflow(ctx))?)
}

impl<Y, K, S> Dispatcher<Y, K, S>
where
    Y: YieldSource,
    K: Keeper,
    S: StreamingProtocol,
{
    pub(super) fn dispatch(
        &mut self,
        tx: &mut Staged<'_>,
        now: u64,
        envelope: &Envelope,
    ) -> Result<EventOutcome, LedgerError> {
        let sender = envelope.sender;

        match envelope.event {
            Event::Deposit { amount } => self.deposit(tx, now, sender, amount),
            Event::Withdraw { amount } => self.withdraw(tx, now, sender, amount),
            Event::Transfer { to, amount } => self.transfer(tx, now, sender, to, amount),
            Event::StreamStart { rate } => self.stream_start(tx, sender, rate),
            Event::StreamUpdate { rate } => self.stream_update(tx, sender, rate),
            Event::StreamStop => self.stream_stop(tx, sender),
            Event::OutStreamStart { rate } => self.out_stream_start(tx, now, sender, rate),
            Event::OutStreamUpdate { rate } => self.out_stream_update(tx, now, sender, rate),
            Event::OutStreamStop => self.out_stream_stop(tx, sender),
            Event::PushToStrategy => self.push_to_strategy(tx),
            Event::WithdrawStep { task_id } => self.withdraw_step(tx, now, task_id),
            Event::Rebalance => self.rebalance(tx),
        }
    }

    /// Balance `p` may move out: everything when it has no outflow, otherwise
    /// what is left above the stream's buffer and the minimum balance. Inbound
    /// collateral sits with the streaming protocol and is not reserved here.
    fn available(&self, p: &ParticipantState) -> u128 {
        let balance = p.balance();
        if !p.has_outflow() {
            return balance;
        }
        let reserved = math::unscale(p.out_stream.buffer).saturating_add(self.config.out_min_balance);
        balance.saturating_sub(reserved)
    }

    // =========================
    // Balances
    // =========================

    fn deposit(
        &mut self,
        tx: &mut Staged<'_>,
        now: u64,
        sender: Address,
        amount: u128,
    ) -> Result<EventOutcome, LedgerError> {
        let amount = require_amount(amount)?;
        let scaled = math::scale(amount)?;

        tx.load_or_create(sender);
        tx.settle(sender)?;

        let p = tx.load(sender)?;
        p.deposit = math::add(p.deposit, scaled, "deposit")?;
        tx.pool.deposit = math::add(tx.pool.deposit, scaled, "pool_deposit")?;
        tx.pool.pool_total_balance =
            math::add(tx.pool.pool_total_balance, amount, "pool_total_balance")?;

        self.rearm(tx, now, sender)?;
        Ok(EventOutcome::Applied)
    }

    fn withdraw(
        &mut self,
        tx: &mut Staged<'_>,
        now: u64,
        sender: Address,
        amount: u128,
    ) -> Result<EventOutcome, LedgerError> {
        let amount = require_amount(amount)?;
        let scaled = math::scale(amount)?;

        tx.settle(sender)?;
        self.debit(tx, sender, amount, scaled)?;

        self.ensure_liquidity(tx, amount)?;
        tx.pool.deposit = math::sub(tx.pool.deposit, scaled, "pool_deposit")?;
        tx.pool.pool_total_balance =
            math::sub(tx.pool.pool_total_balance, amount, "pool_total_balance")?;

        self.rearm(tx, now, sender)?;
        Ok(EventOutcome::Applied)
    }

    fn transfer(
        &mut self,
        tx: &mut Staged<'_>,
        now: u64,
        sender: Address,
        to: Address,
        amount: u128,
    ) -> Result<EventOutcome, LedgerError> {
        let amount = require_amount(amount)?;
        if sender == to {
            return Err(LedgerError::SelfTransfer(sender));
        }
        let scaled = math::scale(amount)?;

        tx.settle(sender)?;
        self.debit(tx, sender, amount, scaled)?;

        tx.load_or_create(to);
        tx.settle(to)?;
        let receiver = tx.load(to)?;
        receiver.deposit = math::add(receiver.deposit, scaled, "transfer")?;

        self.rearm(tx, now, sender)?;
        self.rearm(tx, now, to)?;
        Ok(EventOutcome::Applied)
    }

    /// Takes `amount` out of a settled participant's deposit, subject to the
    /// available balance. The pool side is left to the caller.
    fn debit(
        &self,
        tx: &mut Staged<'_>,
        sender: Address,
        amount: u128,
        scaled: Fixed,
    ) -> Result<(), LedgerError> {
        let available = self.available(tx.load(sender)?);
        if amount > available {
            return Err(LedgerError::InsufficientBalance {
                reason: NOT_ENOUGH_BALANCE,
                required: amount,
                available,
            });
        }

        let p = tx.load(sender)?;
        p.deposit = math::sub(p.deposit, scaled, "debit")?;
        Ok(())
    }

    /// Tops the pool's idle balance up from the yield source so `amount` can
    /// be paid out.
    fn ensure_liquidity(&mut self, tx: &mut Staged<'_>, amount: u128) -> Result<(), LedgerError> {
        let idle = tx.pool.pool_total_balance;
        if idle >= amount {
            return Ok(());
        }

        let need = ceil_to(amount - idle, self.yield_source.granularity());
        if need > tx.pool.yield_snapshot {
            return Err(LedgerError::InsufficientBalance {
                reason: NOT_ENOUGH_LIQUIDITY,
                required: need,
                available: tx.pool.yield_snapshot,
            });
        }

        self.yield_source.withdraw(need)?;
        tx.pool.yield_snapshot -= need;
        tx.pool.pool_total_balance += need;

        info!(amount = need, "pulled liquidity from yield source");
        Ok(())
    }

    // =========================
    // Inbound streams
    // =========================

    fn stream_start(
        &mut self,
        tx: &mut Staged<'_>,
        sender: Address,
        rate: SignedRate,
    ) -> Result<EventOutcome, LedgerError> {
        let rate = require_rate(rate)?;

        tx.load_or_create(sender);
        tx.settle(sender)?;

        if tx.load(sender)?.has_outflow() {
            self.close_outflow(tx, sender, true)?;
        }

        let p = tx.load(sender)?;
        let in_flow = add_rate(p.in_flow, rate, "in_flow")?;
        let in_flow_deposit = self.streaming.flow_deposit(in_flow)?;
        p.in_flow = in_flow;
        p.in_flow_deposit = in_flow_deposit;

        tx.pool.in_flow_rate = add_rate(tx.pool.in_flow_rate, rate, "in_flow_rate")?;

        info!(participant = %sender, rate = in_flow, "inbound stream opened");
        Ok(EventOutcome::Applied)
    }

    fn stream_update(
        &mut self,
        tx: &mut Staged<'_>,
        sender: Address,
        rate: SignedRate,
    ) -> Result<EventOutcome, LedgerError> {
        if rate == 0 {
            return self.stream_stop(tx, sender);
        }
        let rate = require_rate(rate)?;

        if !tx.load(sender)?.has_inflow() {
            return Err(LedgerError::NoActiveStream(sender, INBOUND));
        }
        tx.settle(sender)?;

        let p = tx.load(sender)?;
        let delta = sub_rate(rate, p.in_flow, "in_flow")?;
        let in_flow_deposit = self.streaming.flow_deposit(rate)?;
        p.in_flow = rate;
        p.in_flow_deposit = in_flow_deposit;

        tx.pool.in_flow_rate = add_rate(tx.pool.in_flow_rate, delta, "in_flow_rate")?;

        debug!(participant = %sender, rate, delta, "inbound stream updated");
        Ok(EventOutcome::Applied)
    }

    fn stream_stop(
        &mut self,
        tx: &mut Staged<'_>,
        sender: Address,
    ) -> Result<EventOutcome, LedgerError> {
        if !tx.load(sender)?.has_inflow() {
            return Err(LedgerError::NoActiveStream(sender, INBOUND));
        }
        tx.settle(sender)?;

        let p = tx.load(sender)?;
        let rate = p.in_flow;
        p.in_flow = 0;
        p.in_flow_deposit = 0;

        tx.pool.in_flow_rate = sub_rate(tx.pool.in_flow_rate, rate, "in_flow_rate")?;

        info!(participant = %sender, "inbound stream closed");
        Ok(EventOutcome::Applied)
    }

    // =========================
    // Outbound streams
    // =========================

    #[instrument(skip(self, tx), target = "dispatcher")]
    fn out_stream_start(
        &mut self,
        tx: &mut Staged<'_>,
        now: u64,
        sender: Address,
        rate: SignedRate,
    ) -> Result<EventOutcome, LedgerError> {
        let rate = require_rate(rate)?;

        tx.load(sender)?;
        tx.settle(sender)?;

        let p = tx.load(sender)?;
        if p.has_inflow() || p.has_outflow() {
            return Err(LedgerError::ConflictingStream(sender));
        }

        let balance = p.balance();
        outflow::check_collateral(balance, rate, &self.config)?;
        let buffer = outflow::buffer_for(rate, &self.config)?;
        let plan = outflow::plan_step(&self.config, sender, balance, rate, now)?;

        self.streaming.set_outflow(sender, rate)?;
        self.keeper.schedule_task(plan.task_id, plan.exec_timestamp())?;
        tx.track_task(plan.task_id, sender);

        let p = tx.load(sender)?;
        p.out_flow = rate;
        p.out_stream = OutStream {
            flow: rate,
            stream_duration: plan.stream_duration,
            stream_init: plan.stream_init,
            cancel_task_id: Some(plan.task_id),
            buffer,
        };

        tx.pool.out_flow_rate = add_rate(tx.pool.out_flow_rate, rate, "out_flow_rate")?;
        tx.pool.out_flow_buffer = math::add(tx.pool.out_flow_buffer, buffer, "out_flow_buffer")?;

        info!(
            participant = %sender,
            rate,
            buffer,
            exec_timestamp = plan.exec_timestamp(),
            "outbound stream opened"
        );
        Ok(EventOutcome::Applied)
    }

    fn out_stream_update(
        &mut self,
        tx: &mut Staged<'_>,
        now: u64,
        sender: Address,
        rate: SignedRate,
    ) -> Result<EventOutcome, LedgerError> {
        if rate == 0 {
            return self.out_stream_stop(tx, sender);
        }
        let rate = require_rate(rate)?;

        if !tx.load(sender)?.has_outflow() {
            return Err(LedgerError::NoActiveStream(sender, OUTBOUND));
        }
        tx.settle(sender)?;

        let p = tx.load(sender)?;
        let balance = p.balance();
        let (old_rate, old_buffer, old_task) =
            (p.out_flow, p.out_stream.buffer, p.out_stream.cancel_task_id);

        outflow::check_collateral(balance, rate, &self.config)?;
        let buffer = outflow::buffer_for(rate, &self.config)?;
        let plan = outflow::plan_step(&self.config, sender, balance, rate, now)?;

        self.streaming.set_outflow(sender, rate)?;
        self.install_step(tx, sender, old_task, plan)?;

        let p = tx.load(sender)?;
        p.out_flow = rate;
        p.out_stream.flow = rate;
        p.out_stream.buffer = buffer;

        tx.pool.out_flow_rate = add_rate(
            tx.pool.out_flow_rate,
            sub_rate(rate, old_rate, "out_flow")?,
            "out_flow_rate",
        )?;
        tx.pool.out_flow_buffer = math::add(
            tx.pool.out_flow_buffer.saturating_sub(old_buffer),
            buffer,
            "out_flow_buffer",
        )?;

        debug!(participant = %sender, rate, old_rate, buffer, "outbound stream updated");
        Ok(EventOutcome::Applied)
    }

    fn out_stream_stop(
        &mut self,
        tx: &mut Staged<'_>,
        sender: Address,
    ) -> Result<EventOutcome, LedgerError> {
        if !tx.load(sender)?.has_outflow() {
            return Err(LedgerError::NoActiveStream(sender, OUTBOUND));
        }
        tx.settle(sender)?;
        self.close_outflow(tx, sender, true)?;
        Ok(EventOutcome::Applied)
    }

    /// Removes a settled participant's outflow: releases its buffer, forgets
    /// its task (cancelling it with the keeper when `cancel_task` is set) and
    /// closes the protocol stream.
    fn close_outflow(
        &mut self,
        tx: &mut Staged<'_>,
        address: Address,
        cancel_task: bool,
    ) -> Result<(), LedgerError> {
        let p = tx.load(address)?;
        let (rate, buffer, live) = (p.out_flow, p.out_stream.buffer, p.out_stream.cancel_task_id);

        if let Some(id) = live {
            if cancel_task {
                self.keeper.cancel_task(id)?;
            }
            tx.untrack_task(id);
        }
        self.streaming.set_outflow(address, 0)?;

        let p = tx.load(address)?;
        p.out_flow = 0;
        p.out_stream = OutStream::default();

        tx.pool.out_flow_rate = sub_rate(tx.pool.out_flow_rate, rate, "out_flow_rate")?;
        tx.pool.out_flow_buffer = tx.pool.out_flow_buffer.saturating_sub(buffer);

        info!(participant = %address, released = buffer, "outbound stream closed");
        Ok(())
    }

    // =========================
    // Step scheduling
    // =========================

    /// Replaces the participant's live task (if any) with `plan`.
    fn install_step(
        &mut self,
        tx: &mut Staged<'_>,
        address: Address,
        replaced: Option<TaskId>,
        plan: StepPlan,
    ) -> Result<(), LedgerError> {
        if replaced != Some(plan.task_id) {
            if let Some(old) = replaced {
                self.keeper.cancel_task(old)?;
                tx.untrack_task(old);
            }
            self.keeper.schedule_task(plan.task_id, plan.exec_timestamp())?;
            tx.track_task(plan.task_id, address);
        }

        let p = tx.load(address)?;
        p.out_stream.stream_init = plan.stream_init;
        p.out_stream.stream_duration = plan.stream_duration;
        p.out_stream.cancel_task_id = Some(plan.task_id);

        debug!(
            participant = %address,
            exec_timestamp = plan.exec_timestamp(),
            "step armed"
        );
        Ok(())
    }

    /// Moves the step of a participant with an outflow to the time its current
    /// balance reaches the stream's reserve. No-op without an outflow.
    fn rearm(&mut self, tx: &mut Staged<'_>, now: u64, address: Address) -> Result<(), LedgerError> {
        let p = tx.load(address)?;
        if !p.has_outflow() {
            return Ok(());
        }

        let (rate, balance, live) = (p.out_flow, p.balance(), p.out_stream.cancel_task_id);
        let plan = outflow::plan_step(&self.config, address, balance, rate, now)?;
        self.install_step(tx, address, live, plan)
    }

    #[instrument(skip(self, tx), target = "dispatcher", fields(task = %task_id))]
    fn withdraw_step(
        &mut self,
        tx: &mut Staged<'_>,
        now: u64,
        task_id: TaskId,
    ) -> Result<EventOutcome, LedgerError> {
        let Some(owner) = tx.task_owner(&task_id) else {
            warn!("unknown keeper task");
            return Ok(EventOutcome::Ignored {
                reason: "unknown task",
            });
        };

        let live = tx.get(&owner).and_then(|p| p.out_stream.cancel_task_id);
        if live != Some(task_id) {
            warn!(participant = %owner, "stale keeper task");
            tx.untrack_task(task_id);
            return Ok(EventOutcome::Ignored {
                reason: "stale task",
            });
        }

        let settlement = tx.settle(owner)?;
        tx.untrack_task(task_id);

        let p = tx.load(owner)?;
        let (balance, rate) = (p.balance(), p.out_flow);

        match outflow::evaluate_step(&self.config, owner, balance, rate, now)? {
            StepDecision::Close => {
                let buffer_consumed = outflow::buffer_consumed(balance, rate, &self.config)?;
                if settlement.shortfall > 0 {
                    error!(
                        participant = %owner,
                        shortfall = settlement.shortfall,
                        "step ran past the buffer window, pool is short"
                    );
                }

                // The fired task is spent; only forget it.
                tx.load(owner)?.out_stream.cancel_task_id = None;
                self.close_outflow(tx, owner, false)?;
                Ok(EventOutcome::StreamClosed {
                    participant: owner,
                    buffer_consumed,
                    shortfall: settlement.shortfall,
                })
            }
            StepDecision::Rearm(plan) => {
                self.install_step(tx, owner, None, plan)?;
                info!(
                    participant = %owner,
                    exec_timestamp = plan.exec_timestamp(),
                    "step re-armed"
                );
                Ok(EventOutcome::StepRearmed {
                    participant: owner,
                    task_id: plan.task_id,
                    exec_timestamp: plan.exec_timestamp(),
                })
            }
        }
    }

    // =========================
    // Treasury
    // =========================

    /// Idle balance the pool keeps out of the yield source.
    fn target_reserve(&self, tx: &Staged<'_>) -> u128 {
        math::unscale(tx.pool.out_flow_buffer).saturating_add(self.config.liquidity_reserve)
    }

    fn push_to_strategy(&mut self, tx: &mut Staged<'_>) -> Result<EventOutcome, LedgerError> {
        let target = self.target_reserve(tx);
        let idle = tx.pool.pool_total_balance;
        if idle <= target {
            debug!(idle, target, "nothing to push");
            return Ok(EventOutcome::Applied);
        }

        let amount = floor_to(idle - target, self.yield_source.granularity());
        if amount == 0 {
            debug!(idle, target, "idle balance below yield source granularity");
            return Ok(EventOutcome::Applied);
        }

        self.yield_source.deposit(amount)?;
        tx.pool.pool_total_balance = idle - amount;
        tx.pool.yield_snapshot = math::add(tx.pool.yield_snapshot, amount, "yield_snapshot")?;

        info!(amount, "pushed idle balance to yield source");
        Ok(EventOutcome::Applied)
    }

    fn rebalance(&mut self, tx: &mut Staged<'_>) -> Result<EventOutcome, LedgerError> {
        let target = self.target_reserve(tx);
        let idle = tx.pool.pool_total_balance;
        let amount = ceil_to(target.saturating_sub(idle), self.yield_source.granularity())
            .min(tx.pool.yield_snapshot);
        if amount == 0 {
            debug!(idle, target, "reserve satisfied");
            return Ok(EventOutcome::Applied);
        }

        self.yield_source.withdraw(amount)?;
        tx.pool.pool_total_balance = math::add(idle, amount, "pool_total_balance")?;
        tx.pool.yield_snapshot -= amount;

        info!(amount, "reserve topped up from yield source");
        Ok(EventOutcome::Applied)
    }
}
