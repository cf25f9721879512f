// ===============================
// src/pipeline.rs
// ===============================
//
// One tick = Momentum -> Valuation -> Risk -> Coordinator, in that order,
// all reading the same borrowed snapshot. Each stage writes its typed output
// into the TickContext; later stages read from there and fall back when an
// upstream output is missing.
//
use std::collections::BTreeSet;

use tracing::{info, warn};

use crate::config::Settings;
use crate::coordinator::Coordinator;
use crate::domain::{Decision, MarketSnapshot, RiskResult};
use crate::metrics::{AGENT_DECISIONS, FINAL_DECISIONS};
use crate::momentum::MomentumState;
use crate::portfolio::PortfolioState;
use crate::risk::RiskGate;
use crate::valuation::ValuationAgent;

pub struct TickContext<'a> {
    pub market_open: Option<bool>,
    pub portfolio: &'a PortfolioState,
    pub market: Option<Decision>,
    pub valuation: Option<Decision>,
    pub risk: Option<RiskResult>,
    pub final_decision: Option<Decision>,
    observed: Vec<usize>,
}

impl<'a> TickContext<'a> {
    pub fn new(market_open: Option<bool>, portfolio: &'a PortfolioState) -> Self {
        Self { market_open, portfolio, market: None, valuation: None, risk: None, final_decision: None, observed: Vec::new() }
    }

    fn observe(&mut self, snap: &MarketSnapshot) {
        self.observed.push(snap as *const MarketSnapshot as usize);
    }

    /// True when every stage saw the very same snapshot instance.
    pub fn single_snapshot(&self) -> bool {
        self.observed.windows(2).all(|w| w[0] == w[1])
    }

    pub fn stages_run(&self) -> usize { self.observed.len() }

    pub fn market_or_fallback(&self) -> Decision {
        self.market.clone().unwrap_or_else(|| Decision::hold("market output missing"))
    }
    pub fn valuation_or_fallback(&self) -> Decision {
        self.valuation.clone().unwrap_or_else(|| Decision::hold("valuation output missing"))
    }
    pub fn risk_or_fallback(&self) -> RiskResult {
        self.risk.clone().unwrap_or_else(|| RiskResult::veto("risk output missing"))
    }
}

pub enum Agent {
    Momentum(MomentumState),
    Valuation(ValuationAgent),
    Risk(RiskGate),
    Coordinator(Coordinator),
}

impl Agent {
    pub fn name(&self) -> &'static str {
        match self {
            Agent::Momentum(_) => "market",
            Agent::Valuation(_) => "valuation",
            Agent::Risk(_) => "risk",
            Agent::Coordinator(_) => "coord",
        }
    }

    pub fn evaluate(&mut self, snap: &MarketSnapshot, ctx: &mut TickContext) -> Decision {
        ctx.observe(snap);
        match self {
            Agent::Momentum(m) => {
                let d = m.on_tick(snap);
                ctx.market = Some(d.clone());
                d
            }
            Agent::Valuation(v) => {
                let d = v.decide(snap);
                ctx.valuation = Some(d.clone());
                d
            }
            Agent::Risk(gate) => {
                let r = gate.evaluate(snap, &ctx.market_or_fallback(), &ctx.valuation_or_fallback(), ctx.market_open);
                let d = Decision::hold(format!("risk {}: {}", r.status, r.reason)).with_confidence(r.confidence);
                ctx.risk = Some(r);
                d
            }
            Agent::Coordinator(c) => {
                let d = c.merge(
                    snap,
                    &ctx.market_or_fallback(),
                    &ctx.valuation_or_fallback(),
                    &ctx.risk_or_fallback(),
                    ctx.portfolio,
                );
                ctx.final_decision = Some(d.clone());
                d
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct TickOutcome {
    pub market: Decision,
    pub valuation: Decision,
    pub risk: RiskResult,
    pub final_decision: Decision,
    pub single_snapshot: bool,
}

pub struct DecisionPipeline {
    stages: Vec<Agent>,
    symbols: BTreeSet<String>,
}

impl DecisionPipeline {
    pub fn new(stages: Vec<Agent>, symbols: impl IntoIterator<Item = String>) -> Self {
        Self { stages, symbols: symbols.into_iter().collect() }
    }

    pub fn from_settings(s: &Settings) -> Self {
        let risk = RiskGate::new(s.allowlist.clone(), s.max_shares_per_symbol, s.policy.risk_approve_conf)
            .with_forced_veto(s.forced_veto.clone());
        Self::new(
            vec![
                Agent::Momentum(MomentumState::new(&s.policy)),
                Agent::Valuation(ValuationAgent::new(
                    s.symbols.clone(),
                    s.fair_values.clone(),
                    s.max_shares_per_symbol,
                    s.policy.clone(),
                )),
                Agent::Risk(risk),
                Agent::Coordinator(Coordinator::new(s.policy.clone(), s.sell_cooldown_min)),
            ],
            s.symbols.clone(),
        )
    }

    /// Clears cross-tick agent state (momentum prices).
    pub fn reset(&mut self) {
        for stage in &mut self.stages {
            if let Agent::Momentum(m) = stage {
                m.reset();
            }
        }
    }

    /// Symbols outside the tracked set never reach the executor.
    fn sanitize(&self, d: Decision) -> Decision {
        match d.symbol.as_deref() {
            Some(sym) if !self.symbols.contains(sym) => {
                let allowed = self.symbols.iter().cloned().collect::<Vec<_>>().join(",");
                warn!(symbol = sym, "decision names an untracked symbol");
                Decision::hold(format!("invalid symbol returned by agent: {sym}; allowed={allowed}"))
                    .with_confidence(d.confidence)
            }
            _ => d,
        }
    }

    pub fn run(&mut self, snap: &MarketSnapshot, market_open: Option<bool>, portfolio: &PortfolioState) -> TickOutcome {
        let mut ctx = TickContext::new(market_open, portfolio);
        for stage in &mut self.stages {
            let d = stage.evaluate(snap, &mut ctx);
            AGENT_DECISIONS.with_label_values(&[stage.name(), d.action.as_str()]).inc();
        }

        let market = ctx.market_or_fallback();
        let valuation = ctx.valuation_or_fallback();
        let risk = ctx.risk_or_fallback();
        let final_decision = self.sanitize(
            ctx.final_decision.clone().unwrap_or_else(|| Decision::hold("coord output missing")),
        );

        info!("[market] {} {:?} ({})", market.action, market.symbol, market.reason);
        info!("[valuation] {} {:?} ({})", valuation.action, valuation.symbol, valuation.reason);
        info!("[risk] {}: {}", risk.status, risk.reason);
        info!(
            "[coord] final={} {:?} confidence={:.2} ({})",
            final_decision.action, final_decision.symbol, final_decision.confidence, final_decision.reason
        );
        if risk.is_veto() && risk.reason.contains("market closed") {
            info!("US market closed, no live ticks/fills expected now");
        }
        FINAL_DECISIONS.with_label_values(&[final_decision.action.as_str()]).inc();

        TickOutcome { market, valuation, risk, final_decision, single_snapshot: ctx.single_snapshot() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Policy;
    use crate::domain::{Action, RiskStatus};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn snap(cash: f64) -> MarketSnapshot {
        MarketSnapshot::new(Utc::now(), BTreeMap::from([("PLTR".to_string(), 50.0)]), cash, BTreeMap::new())
    }

    fn pipeline() -> DecisionPipeline {
        let policy = Policy::default();
        DecisionPipeline::new(
            vec![
                Agent::Momentum(MomentumState::new(&policy)),
                Agent::Valuation(ValuationAgent::new(
                    vec!["PLTR".into()],
                    BTreeMap::from([("PLTR".to_string(), 95.0)]),
                    5,
                    policy.clone(),
                )),
                Agent::Risk(RiskGate::new(BTreeSet::from(["PLTR".to_string()]), 5, 0.7)),
                Agent::Coordinator(Coordinator::new(policy, 120)),
            ],
            vec!["PLTR".to_string()],
        )
    }

    #[test]
    fn every_stage_sees_the_same_snapshot() {
        let pf = PortfolioState::new();
        let s = snap(1000.0);
        let mut ctx = TickContext::new(Some(true), &pf);
        let mut p = pipeline();
        for stage in &mut p.stages {
            stage.evaluate(&s, &mut ctx);
        }
        assert_eq!(ctx.stages_run(), 4);
        assert!(ctx.single_snapshot());

        let other = snap(1000.0);
        p.stages[0].evaluate(&other, &mut ctx);
        assert!(!ctx.single_snapshot());
    }

    #[test]
    fn cheap_symbol_becomes_buy() {
        let pf = PortfolioState::new();
        let out = pipeline().run(&snap(1000.0), Some(true), &pf);
        assert_eq!(out.valuation.action, Action::Buy);
        assert_eq!(out.risk.status, RiskStatus::Approve);
        assert_eq!(out.final_decision.action, Action::Buy);
        assert_eq!(out.final_decision.symbol.as_deref(), Some("PLTR"));
        assert!(out.single_snapshot);
    }

    #[test]
    fn missing_risk_stage_vetoes() {
        let pf = PortfolioState::new();
        let policy = Policy::default();
        let mut p = DecisionPipeline::new(
            vec![
                Agent::Valuation(ValuationAgent::new(
                    vec!["PLTR".into()],
                    BTreeMap::from([("PLTR".to_string(), 95.0)]),
                    5,
                    policy.clone(),
                )),
                Agent::Coordinator(Coordinator::new(policy, 120)),
            ],
            vec!["PLTR".to_string()],
        );
        let out = p.run(&snap(1000.0), Some(true), &pf);
        assert_eq!(out.market.reason, "market output missing");
        assert_eq!(out.final_decision.action, Action::Hold);
        assert!(out.final_decision.reason.starts_with("risk veto: risk output missing"));
    }

    #[test]
    fn untracked_symbol_is_demoted() {
        let p = DecisionPipeline::new(Vec::new(), vec!["PLTR".to_string()]);
        let d = p.sanitize(Decision::buy("TSLA", 1, "x"));
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.reason, "invalid symbol returned by agent: TSLA; allowed=PLTR");
    }
}
