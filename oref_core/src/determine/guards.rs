//! The decision guards, in the order `GUARDS` runs them.
//!
//! A guard returns `Some(action)` to end the cycle; `None` passes control on.

use super::{Action, Context, Trail, smb};
use crate::glucose::SENSOR_ERROR_MAX;
use crate::temp;
use crate::util::{round_basal, round_to};

fn rb(ctx: &Context<'_>, rate: f64) -> f64 {
    round_basal(rate, ctx.profile.pump_model.as_deref())
}

/// Pass a rate through the temp-basal rules and record their note.
fn commit(ctx: &Context<'_>, trail: &mut Trail, rate: f64, duration: f64) -> Action {
    let req = temp::set_temp_basal(rate, duration, ctx.profile, ctx.inputs.current_temp);
    if let Some(note) = &req.note {
        trail.push(note);
    }
    match req.rate {
        Some(rate) => Action { rate: Some(rate), duration: req.duration },
        None => Action::NONE,
    }
}

/// Keep a running temp that already matches basal, otherwise set basal as temp.
fn hold_basal(ctx: &Context<'_>, trail: &mut Trail) -> Action {
    let ct = &ctx.current_temp;
    if ct.duration > 15.0 && rb(ctx, ctx.basal) == rb(ctx, ct.rate) {
        trail.push(format!(", temp {} ~ req {}U/hr. ", ct.rate, ctx.basal));
        return Action::NONE;
    }
    trail.push(format!("; setting current basal of {} as temp. ", ctx.basal));
    commit(ctx, trail, ctx.basal, 30.0)
}

fn minutes_since(ctx: &Context<'_>, t: chrono::DateTime<chrono::Utc>) -> f64 {
    (ctx.inputs.now - t).num_milliseconds() as f64 / 60_000.0
}

pub(super) fn extreme_low(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    if ctx.bg <= SENSOR_ERROR_MAX && ctx.high_temp_running() {
        trail.push(format!(
            "Replacing high temp basal of {} with neutral temp of {}",
            ctx.current_temp.rate, ctx.profile_basal
        ));
        return Some(Action::temp(ctx.profile_basal, 30.0));
    }
    None
}

pub(super) fn stale_glucose(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    let g = ctx.glucose;
    let age = ctx.bg_age_min;
    let stale = age > 12.0 || age < -5.0;
    let flat = ctx.bg > 60.0
        && g.delta == 0.0
        && g.short_avgdelta.abs() < 1.0
        && g.long_avgdelta.abs() < 1.0;
    if !(stale || flat || ctx.bg <= SENSOR_ERROR_MAX) {
        return None;
    }
    if stale {
        trail.push(format!(
            "If current system time {} is correct, then BG data is too old. The last BG data was read {}m ago at {}",
            ctx.inputs.now.to_rfc3339(),
            round_to(age, 1),
            g.date.to_rfc3339()
        ));
    } else if flat {
        trail.push(format!(
            "CGM data is unchanged ({}+{}) for 5m w/ {} mg/dL ~15m change & {} mg/dL ~45m change",
            ctx.fmt_bg(ctx.bg),
            g.delta,
            g.short_avgdelta,
            g.long_avgdelta
        ));
    } else {
        trail.push(format!("CGM reading of {} is not usable", ctx.bg));
    }
    tracing::warn!(bg = ctx.bg, age_min = age, "glucose unusable");

    let ct = &ctx.current_temp;
    if ctx.high_temp_running() {
        trail.push(format!(
            ". Replacing high temp basal of {} with neutral temp of {}",
            ct.rate, ctx.profile_basal
        ));
        return Some(Action::temp(ctx.profile_basal, 30.0));
    }
    if ct.rate == 0.0 && ct.duration > 30.0 {
        trail.push(format!(". Shortening {}m long zero temp to 30m. ", ct.duration));
        return Some(Action::temp(0.0, 30.0));
    }
    trail.push(format!(
        ". Temp {} <= current basal {}U/hr; doing nothing. ",
        ct.rate, ctx.profile_basal
    ));
    Some(Action::NONE)
}

/// The pump says one thing, the history another: cancel and start over.
pub(super) fn history_mismatch(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    let last = ctx.iob.last_temp?;
    let ct = &ctx.current_temp;
    if ct.duration <= 0.0 {
        return None;
    }
    let age = minutes_since(ctx, last.timestamp).round();
    if ct.rate != last.rate && age > 10.0 {
        trail.push(format!(
            "Warning: currenttemp rate {} != lastTemp rate {} from pumphistory; canceling temp",
            ct.rate, last.rate
        ));
        tracing::warn!(current = ct.rate, history = last.rate, "temp basal mismatch");
        return Some(commit(ctx, trail, 0.0, 0.0));
    }
    let ended_ago = age - last.duration;
    if ended_ago > 5.0 && age > 10.0 {
        trail.push(format!(
            "Warning: currenttemp running but lastTemp from pumphistory ended {}m ago; canceling temp",
            round_to(ended_ago, 2)
        ));
        tracing::warn!(ended_ago, "temp basal outlived history");
        return Some(commit(ctx, trail, 0.0, 0.0));
    }
    None
}

pub(super) fn low_glucose_suspend(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    let iob = ctx.iob.iob();
    let min_guard = ctx.forecast.min_guard_bg;
    let basal_20m = -ctx.profile.current_basal * 20.0 / 60.0;
    if ctx.bg < ctx.threshold
        && iob < basal_20m
        && ctx.min_delta > 0.0
        && ctx.min_delta > ctx.expected_delta
    {
        trail.push(format!(
            "IOB {} < {} and minDelta {} > expectedDelta {}; ",
            round_to(iob, 2),
            round_to(basal_20m, 2),
            ctx.fmt_bg(ctx.min_delta),
            ctx.fmt_bg(ctx.expected_delta)
        ));
        return None;
    }
    if ctx.bg < ctx.threshold || min_guard < ctx.threshold {
        trail.push(format!(
            "minGuardBG {}<{}",
            ctx.fmt_bg(min_guard),
            ctx.fmt_bg(ctx.threshold)
        ));
        let worst_case = (ctx.target_bg - min_guard) / ctx.sens;
        let minutes = (60.0 * worst_case / ctx.profile.current_basal).round();
        let duration = ((minutes / 30.0).round() * 30.0).clamp(30.0, 120.0);
        return Some(commit(ctx, trail, 0.0, duration));
    }
    None
}

pub(super) fn top_of_hour(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    let minute = ctx.local_minute_of_hour();
    if ctx.profile.preferences.skip_neutral_temps && minute >= 55 && !ctx.enable_smb {
        trail.push(format!("; Canceling temp at {minute}m past the hour. "));
        return Some(commit(ctx, trail, 0.0, 0.0));
    }
    None
}

pub(super) fn below_min_bg(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    if ctx.eventual_bg >= ctx.min_bg {
        return None;
    }
    let g = ctx.glucose;
    let ct = &ctx.current_temp;
    trail.push(format!(
        "Eventual BG {} < {}",
        ctx.fmt_bg(ctx.eventual_bg),
        ctx.fmt_bg(ctx.min_bg)
    ));

    // Rising faster than expected: settle for basal.
    if ctx.min_delta > ctx.expected_delta && ctx.min_delta > 0.0 {
        if ctx.naive_eventual_bg < 40.0 {
            trail.push(", naive_eventualBG < 40. ");
            return Some(commit(ctx, trail, 0.0, 30.0));
        }
        if g.delta > ctx.min_delta {
            trail.push(format!(
                ", but Delta {} > expectedDelta {}",
                ctx.fmt_bg(g.delta),
                ctx.fmt_bg(ctx.expected_delta)
            ));
        } else {
            trail.push(format!(
                ", but Min. Delta {} > Exp. Delta {}",
                round_to(ctx.min_delta, 2),
                ctx.fmt_bg(ctx.expected_delta)
            ));
        }
        return Some(hold_basal(ctx, trail));
    }

    let mut insulin_req = round_to(2.0 * ((ctx.eventual_bg - ctx.target_bg) / ctx.sens).min(0.0), 2);
    let naive_insulin_req =
        round_to(((ctx.naive_eventual_bg - ctx.target_bg) / ctx.sens).min(0.0), 2);
    if ctx.min_delta < 0.0 && ctx.min_delta > ctx.expected_delta {
        insulin_req = round_to(insulin_req * (ctx.min_delta / ctx.expected_delta), 2);
    }
    let rate = rb(ctx, ctx.basal + 2.0 * insulin_req);
    let insulin_scheduled = ct.duration * (ct.rate - ctx.basal) / 60.0;
    let min_insulin_req = insulin_req.min(naive_insulin_req);

    if insulin_scheduled < min_insulin_req - ctx.basal * 0.3 {
        trail.push(format!(
            ", {}m@{:.2} is a lot less than needed. ",
            ct.duration, ct.rate
        ));
        return Some(commit(ctx, trail, rate, 30.0));
    }
    if ct.duration > 5.0 && rate >= ct.rate * 0.8 {
        trail.push(format!(", temp {} ~< req {}U/hr. ", ct.rate, rate));
        return Some(Action::NONE);
    }
    if rate <= 0.0 {
        let undershoot = ctx.target_bg - ctx.naive_eventual_bg;
        let minutes = (60.0 * (undershoot / ctx.sens) / ctx.profile.current_basal).round();
        if minutes > 0.0 {
            let duration = if minutes < 22.5 {
                15.0
            } else if minutes < 45.0 {
                30.0
            } else {
                60.0
            };
            trail.push(format!(", setting {duration}m zero temp. "));
            return Some(commit(ctx, trail, rate, duration));
        }
    } else {
        trail.push(format!(", setting {rate}U/hr. "));
    }
    Some(commit(ctx, trail, rate, 30.0))
}

pub(super) fn falling_faster(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    if ctx.min_delta >= ctx.expected_delta || ctx.smb_path() {
        return None;
    }
    if ctx.glucose.delta < ctx.min_delta {
        trail.push(format!(
            "Eventual BG {} > {} but Delta {} < Exp. Delta {}",
            ctx.fmt_bg(ctx.eventual_bg),
            ctx.fmt_bg(ctx.min_bg),
            ctx.fmt_bg(ctx.glucose.delta),
            ctx.fmt_bg(ctx.expected_delta)
        ));
    } else {
        trail.push(format!(
            "Eventual BG {} > {} but Min. Delta {} < Exp. Delta {}",
            ctx.fmt_bg(ctx.eventual_bg),
            ctx.fmt_bg(ctx.min_bg),
            round_to(ctx.min_delta, 2),
            ctx.fmt_bg(ctx.expected_delta)
        ));
    }
    Some(hold_basal(ctx, trail))
}

pub(super) fn in_range(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    let low = ctx.eventual_bg.min(ctx.forecast.min_pred_bg);
    if low >= ctx.max_bg || ctx.smb_path() {
        return None;
    }
    trail.push(format!(
        "{}-{} in range: no temp required",
        ctx.fmt_bg(ctx.eventual_bg),
        ctx.fmt_bg(ctx.forecast.min_pred_bg)
    ));
    Some(hold_basal(ctx, trail))
}

pub(super) fn max_iob(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    if ctx.eventual_bg >= ctx.max_bg {
        trail.push(format!(
            "Eventual BG {} >= {}, ",
            ctx.fmt_bg(ctx.eventual_bg),
            ctx.fmt_bg(ctx.max_bg)
        ));
    }
    let iob = ctx.iob.iob();
    if iob > ctx.profile.max_iob {
        trail.push(format!("IOB {} > max_iob {}", round_to(iob, 2), ctx.profile.max_iob));
        return Some(hold_basal(ctx, trail));
    }
    None
}

/// Computes the insulin requirement for the guards after it. Never terminal.
pub(super) fn insulin_required(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    let low = ctx.forecast.min_pred_bg.min(ctx.eventual_bg);
    let mut req = round_to((low - ctx.target_bg) / ctx.sens, 2);
    let headroom = ctx.profile.max_iob - ctx.iob.iob();
    if req > headroom && headroom >= 0.0 {
        trail.push(format!("max_iob {}, ", ctx.profile.max_iob));
        req = headroom;
    }
    trail.insulin_req = Some(round_to(req, 2));
    None
}

pub(super) fn micro_bolus(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    if !ctx.smb_path() || ctx.bg <= ctx.threshold {
        return None;
    }
    let req = trail.insulin_req.unwrap_or(0.0);
    let worst_case =
        (ctx.target_bg - (ctx.naive_eventual_bg + ctx.forecast.min_iob_pred_bg) / 2.0) / ctx.sens;
    let plan = smb::size_micro_bolus(
        ctx.profile,
        ctx.inputs.custom,
        ctx.inputs.meal.meal_cob,
        ctx.iob.iob(),
        req,
        ctx.basal,
        worst_case,
    );

    trail.push(format!(" insulinReq {req}"));
    if plan.units >= plan.max_bolus {
        trail.push(format!("; maxBolus {}", plan.max_bolus));
    }
    if plan.duration_req > 0.0 {
        trail.push(format!(
            "; setting {}m low temp of {}U/h",
            plan.duration_req, plan.low_temp_rate
        ));
    }
    trail.push(". ");

    let interval = ctx.profile.preferences.smb_interval;
    let last_bolus_age = ctx
        .iob
        .last_bolus_time
        .map_or(f64::INFINITY, |t| round_to(minutes_since(ctx, t), 1));
    if last_bolus_age > interval {
        if plan.units > 0.0 {
            trail.units = Some(plan.units);
            trail.push(format!("Microbolusing {}U. ", plan.units));
        }
    } else {
        let wait = interval - last_bolus_age;
        let secs = (wait * 60.0).round() % 60.0;
        trail.push(format!(
            "Waiting {}m {}s to microbolus again. ",
            wait.round(),
            secs
        ));
    }
    tracing::debug!(units = plan.units, max_bolus = plan.max_bolus, last_bolus_age, "micro-bolus");

    if plan.duration_req > 0.0 {
        return Some(Action::temp(plan.low_temp_rate, plan.duration_req));
    }
    None
}

pub(super) fn high_temp(ctx: &Context<'_>, trail: &mut Trail) -> Option<Action> {
    let req = trail.insulin_req.unwrap_or(0.0);
    let max_safe = temp::max_safe_basal(ctx.profile);
    let mut rate = rb(ctx, ctx.basal + 2.0 * req);
    if rate > max_safe {
        trail.push(format!(
            "adj. req. rate: {} to maxSafeBasal: {}, ",
            rate,
            round_to(max_safe, 2)
        ));
        rate = rb(ctx, max_safe);
    }

    let ct = &ctx.current_temp;
    let insulin_scheduled = ct.duration * (ct.rate - ctx.basal) / 60.0;
    if insulin_scheduled >= 2.0 * req {
        trail.push(format!(
            "{}m@{:.2} > 2 * insulinReq. Setting temp basal of {}U/hr. ",
            ct.duration, ct.rate, rate
        ));
        return Some(commit(ctx, trail, rate, 30.0));
    }
    if ct.duration <= 0.0 {
        trail.push(format!("no temp, setting {rate}U/hr. "));
        return Some(commit(ctx, trail, rate, 30.0));
    }
    if ct.duration > 5.0 && rb(ctx, rate) <= rb(ctx, ct.rate) {
        trail.push(format!("temp {} >~ req {}U/hr. ", ct.rate, rate));
        return Some(Action::NONE);
    }
    trail.push(format!("temp {}<{}U/hr. ", ct.rate, rate));
    Some(commit(ctx, trail, rate, 30.0))
}
