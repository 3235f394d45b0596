// =============================================================================
// Account Risk Guard — account-level loss limits across all symbols
// =============================================================================
//
// Tracks daily P&L against an absolute limit and drawdown against the peak
// balance. A breach flips the state machine out of `Active`, optionally
// closes every open position through the broker, and (via the orchestrator)
// halts execution and evaluation. The daily window resets at a configured
// local time, offset-aware; a daily-loss breach clears back to `Active` on
// that reset. Manual stop/resume bypass the automatic rules.
//
//   active ──daily loss──▶ daily_loss_breached ──daily reset──▶ active
//   active ──drawdown───▶ drawdown_breached
//   any ──manual_stop──▶ manually_stopped ──manual_resume──▶ active
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::broker::BrokerAdapter;
use crate::bus::EventBus;
use crate::events::{Event, EventPayload};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Account guard status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskStatus {
    Active,
    DailyLossBreached,
    DrawdownBreached,
    ManuallyStopped,
    Recovering,
}

impl std::fmt::Display for RiskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::DailyLossBreached => "daily_loss_breached",
            Self::DrawdownBreached => "drawdown_breached",
            Self::ManuallyStopped => "manually_stopped",
            Self::Recovering => "recovering",
        };
        write!(f, "{s}")
    }
}

/// Guard configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountStopConfig {
    /// Absolute daily loss limit (account currency).
    pub daily_loss_limit: f64,
    /// Max drawdown from peak balance, percent.
    pub max_drawdown_pct: f64,
    pub close_positions_on_breach: bool,
    pub stop_trading_on_breach: bool,
    /// "HH:MM:SS" local reset time.
    pub daily_reset_time: String,
    /// "+HH:MM" / "-HH:MM" offset applied to the reset time.
    pub timezone_offset: String,
}

impl Default for AccountStopConfig {
    fn default() -> Self {
        Self {
            daily_loss_limit: 1_000.0,
            max_drawdown_pct: 10.0,
            close_positions_on_breach: true,
            stop_trading_on_breach: true,
            daily_reset_time: "00:00:00".to_string(),
            timezone_offset: "+00:00".to_string(),
        }
    }
}

/// Metrics snapshot produced by every update.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountMetrics {
    pub current_balance: f64,
    pub starting_balance: f64,
    pub peak_balance: f64,
    pub daily_pnl: f64,
    pub drawdown_pct: f64,
    pub open_positions: usize,
    pub total_exposure: f64,
    pub status: RiskStatus,
}

// ---------------------------------------------------------------------------
// Internal mutable state
// ---------------------------------------------------------------------------

struct Inner {
    status: RiskStatus,
    starting_balance: Option<f64>,
    peak_balance: Option<f64>,
    current_balance: Option<f64>,
    daily_pnl: f64,
    drawdown_pct: f64,
    breach_time: Option<DateTime<Utc>>,
    breach_reason: Option<String>,
    last_reset_date: Option<NaiveDate>,
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Account-level risk guard consulted by the orchestrator's driver loop.
pub struct AccountRiskGuard {
    cfg: AccountStopConfig,
    broker: Arc<dyn BrokerAdapter>,
    bus: Option<Arc<EventBus>>,
    state: RwLock<Inner>,
}

impl AccountRiskGuard {
    pub fn new(
        cfg: AccountStopConfig,
        broker: Arc<dyn BrokerAdapter>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        info!(
            daily_loss_limit = cfg.daily_loss_limit,
            max_drawdown_pct = cfg.max_drawdown_pct,
            "account risk guard initialised"
        );
        Self {
            cfg,
            broker,
            bus,
            state: RwLock::new(Inner {
                status: RiskStatus::Active,
                starting_balance: None,
                peak_balance: None,
                current_balance: None,
                daily_pnl: 0.0,
                drawdown_pct: 0.0,
                breach_time: None,
                breach_reason: None,
                last_reset_date: None,
            }),
        }
    }

    pub fn config(&self) -> &AccountStopConfig {
        &self.cfg
    }

    /// Seed the guard with the session's starting balance.
    pub fn initialize(&self, starting_balance: f64) {
        let mut s = self.state.write();
        s.starting_balance = Some(starting_balance);
        s.peak_balance = Some(starting_balance);
        s.current_balance = Some(starting_balance);
        s.last_reset_date = Some(self.trading_day(Utc::now()));
        info!(starting_balance, "risk guard seeded");
    }

    /// Feed fresh account figures; applies the daily reset and breach rules.
    pub fn update_account_metrics(
        &self,
        current_balance: f64,
        open_positions: usize,
        total_exposure: f64,
    ) -> AccountMetrics {
        self.update_at(current_balance, open_positions, total_exposure, Utc::now())
    }

    fn update_at(
        &self,
        current_balance: f64,
        open_positions: usize,
        total_exposure: f64,
        now: DateTime<Utc>,
    ) -> AccountMetrics {
        if self.state.read().starting_balance.is_none() {
            self.initialize(current_balance);
        }

        let (metrics, close_all) = {
            let mut s = self.state.write();

            self.maybe_daily_reset(&mut s, now);

            s.current_balance = Some(current_balance);
            let peak = s
                .peak_balance
                .unwrap_or(current_balance)
                .max(current_balance);
            s.peak_balance = Some(peak);

            let starting = s.starting_balance.unwrap_or(current_balance);
            s.daily_pnl = current_balance - starting;
            s.drawdown_pct = if peak > 0.0 {
                ((peak - current_balance) / peak * 100.0).max(0.0)
            } else {
                0.0
            };

            let close_all = self.check_breach(&mut s, now);

            debug!(
                balance = current_balance,
                daily_pnl = s.daily_pnl,
                drawdown_pct = s.drawdown_pct,
                status = %s.status,
                "account metrics updated"
            );

            (
                AccountMetrics {
                    current_balance,
                    starting_balance: starting,
                    peak_balance: peak,
                    daily_pnl: s.daily_pnl,
                    drawdown_pct: s.drawdown_pct,
                    open_positions,
                    total_exposure,
                    status: s.status,
                },
                close_all,
            )
        };

        if close_all {
            self.close_all_positions();
        }
        metrics
    }

    pub fn is_trading_allowed(&self) -> bool {
        self.state.read().status == RiskStatus::Active
    }

    pub fn status(&self) -> RiskStatus {
        self.state.read().status
    }

    pub fn stop_reason(&self) -> Option<String> {
        let s = self.state.read();
        if s.status == RiskStatus::Active {
            None
        } else {
            Some(
                s.breach_reason
                    .clone()
                    .unwrap_or_else(|| format!("trading stopped: {}", s.status)),
            )
        }
    }

    /// Halt trading by operator request.
    pub fn manual_stop(&self, reason: &str) {
        {
            let mut s = self.state.write();
            warn!(reason, "manual trading stop");
            s.status = RiskStatus::ManuallyStopped;
            s.breach_time = Some(Utc::now());
            s.breach_reason = Some(reason.to_string());
        }
        if self.cfg.close_positions_on_breach {
            self.close_all_positions();
        }
    }

    /// Resume from a manual stop. Breach states cannot be resumed manually.
    pub fn manual_resume(&self) {
        let mut s = self.state.write();
        if s.status == RiskStatus::ManuallyStopped {
            info!("manual trading resume");
            s.status = RiskStatus::Active;
            s.breach_time = None;
            s.breach_reason = None;
        } else {
            warn!(status = %s.status, "manual resume rejected");
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    fn offset(&self) -> FixedOffset {
        parse_offset(&self.cfg.timezone_offset)
            .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap())
    }

    fn reset_time(&self) -> NaiveTime {
        NaiveTime::parse_from_str(&self.cfg.daily_reset_time, "%H:%M:%S")
            .unwrap_or_else(|_| NaiveTime::from_hms_opt(0, 0, 0).unwrap())
    }

    /// The "trading day" a timestamp belongs to: days roll at the configured
    /// reset time in the configured offset.
    fn trading_day(&self, now: DateTime<Utc>) -> NaiveDate {
        let local = now.with_timezone(&self.offset());
        let date = local.date_naive();
        if local.time() < self.reset_time() {
            date.pred_opt().unwrap_or(date)
        } else {
            date
        }
    }

    fn maybe_daily_reset(&self, s: &mut Inner, now: DateTime<Utc>) {
        let today = self.trading_day(now);
        let rolled = s.last_reset_date.map(|d| today > d).unwrap_or(false);
        if !rolled {
            if s.last_reset_date.is_none() {
                s.last_reset_date = Some(today);
            }
            return;
        }

        info!(
            previous_daily_pnl = s.daily_pnl,
            date = %today,
            "daily risk reset"
        );
        s.starting_balance = s.current_balance.or(s.starting_balance);
        s.daily_pnl = 0.0;
        s.last_reset_date = Some(today);

        if s.status == RiskStatus::DailyLossBreached {
            info!("daily loss breach cleared by daily reset");
            s.status = RiskStatus::Active;
            s.breach_time = None;
            s.breach_reason = None;
        }
    }

    /// Returns true when a fresh breach requires closing all positions.
    fn check_breach(&self, s: &mut Inner, now: DateTime<Utc>) -> bool {
        if s.status != RiskStatus::Active {
            return false;
        }

        let (status, reason, current, limit, limit_type) =
            if s.daily_pnl < -self.cfg.daily_loss_limit {
                (
                    RiskStatus::DailyLossBreached,
                    format!(
                        "daily loss limit breached: {:+.2} < -{:.2}",
                        s.daily_pnl, self.cfg.daily_loss_limit
                    ),
                    s.daily_pnl,
                    self.cfg.daily_loss_limit,
                    "daily_loss",
                )
            } else if s.drawdown_pct > self.cfg.max_drawdown_pct {
                (
                    RiskStatus::DrawdownBreached,
                    format!(
                        "max drawdown breached: {:.2}% > {:.2}%",
                        s.drawdown_pct, self.cfg.max_drawdown_pct
                    ),
                    s.drawdown_pct,
                    self.cfg.max_drawdown_pct,
                    "max_drawdown",
                )
            } else {
                return false;
            };

        error!(reason = %reason, balance = ?s.current_balance, "ACCOUNT RISK BREACH");
        s.status = status;
        s.breach_time = Some(now);
        s.breach_reason = Some(reason);

        if let Some(bus) = &self.bus {
            bus.publish(Event::new(EventPayload::RiskLimitBreached {
                limit_type: limit_type.to_string(),
                current_value: current,
                limit_value: limit,
                symbol: None,
            }));
        }

        self.cfg.close_positions_on_breach
    }

    fn close_all_positions(&self) {
        let positions = match self.broker.open_positions() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "close-all: failed to list positions");
                return;
            }
        };
        if positions.is_empty() {
            info!("close-all: no open positions");
            return;
        }

        warn!(count = positions.len(), "closing all open positions");
        let mut closed = 0usize;
        let mut failed = 0usize;
        for p in positions {
            match self.broker.close_position(&p.symbol, p.ticket, None) {
                Ok(resp) if resp.is_done() => closed += 1,
                Ok(resp) => {
                    failed += 1;
                    let err = crate::errors::BrokerError::Rejected {
                        retcode: resp.retcode,
                        comment: resp.comment,
                    };
                    error!(ticket = p.ticket, error = %err, "close-all rejected");
                }
                Err(e) => {
                    failed += 1;
                    error!(ticket = p.ticket, error = %e, "close-all failed");
                }
            }
        }
        info!(closed, failed, "close-all complete");
    }
}

fn parse_offset(s: &str) -> Option<FixedOffset> {
    let s = s.trim();
    let (sign, rest) = if let Some(rest) = s.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = s.strip_prefix('-') {
        (-1, rest)
    } else {
        return None;
    };
    let mut parts = rest.split(':');
    let hours: i32 = parts.next()?.parse().ok()?;
    let minutes: i32 = parts.next().unwrap_or("0").parse().ok()?;
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
