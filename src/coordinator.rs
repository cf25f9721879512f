// ===============================
// src/coordinator.rs
// ===============================
use tracing::info;

use crate::config::Policy;
use crate::domain::{clamp_confidence, Action, Decision, MarketSnapshot, RiskResult};
use crate::portfolio::PortfolioState;

/// Confidence-weighted merge of the market, valuation and risk outputs.
/// Holds no state of its own; the sell-cooldown input is lent per call.
#[derive(Debug, Clone)]
pub struct Coordinator {
    policy: Policy,
    sell_cooldown_min: i64,
}

impl Coordinator {
    pub fn new(policy: Policy, sell_cooldown_min: i64) -> Self {
        Self { policy, sell_cooldown_min }
    }

    pub fn weighted(&self, market: f64, valuation: f64, risk: f64) -> f64 {
        let p = &self.policy;
        p.weight_market * clamp_confidence(market)
            + p.weight_valuation * clamp_confidence(valuation)
            + p.weight_risk * clamp_confidence(risk)
    }

    /// Valuation confidence after the re-entry penalty: capped at the cooldown
    /// ceiling while the symbol is inside its sell cooldown.
    pub fn effective_valuation_conf(&self, valuation: &Decision, snapshot: &MarketSnapshot, portfolio: &PortfolioState) -> f64 {
        let conf = clamp_confidence(valuation.confidence);
        match valuation.symbol.as_deref() {
            Some(sym) if portfolio.in_sell_cooldown(sym, snapshot.timestamp(), self.sell_cooldown_min) => {
                conf.min(self.policy.cooldown_conf_ceiling)
            }
            _ => conf,
        }
    }

    pub fn merge(
        &self,
        snapshot: &MarketSnapshot,
        market: &Decision,
        valuation: &Decision,
        risk: &RiskResult,
        portfolio: &PortfolioState,
    ) -> Decision {
        let upstream = format!("market={} | valuation={}", market.audit(), valuation.audit());

        if risk.is_veto() {
            let conf = self.weighted(market.confidence, valuation.confidence, 1.0);
            info!(market = market.confidence, valuation = valuation.confidence, risk = 1.0, final_conf = conf, "confidence");
            return Decision::hold(format!("risk veto: {} | {upstream}", risk.reason)).with_confidence(conf);
        }

        let eff_val = if valuation.action == Action::Buy {
            self.effective_valuation_conf(valuation, snapshot, portfolio)
        } else {
            clamp_confidence(valuation.confidence)
        };
        let conf = self.weighted(market.confidence, eff_val, risk.confidence);
        info!(valuation = eff_val, market = market.confidence, risk = risk.confidence, final_conf = conf, "confidence");

        match valuation.action {
            Action::Sell => Decision { confidence: clamp_confidence(conf), ..valuation.clone() },
            Action::Buy => {
                let p = &self.policy;
                if eff_val < p.min_valuation_conf || conf < p.min_final_conf {
                    return Decision::hold(format!(
                        "buy confidence too low | valuation_conf={eff_val:.2} final_conf={conf:.2} | {upstream}"
                    ))
                    .with_confidence(conf);
                }
                if market.action == Action::Sell {
                    return Decision::hold(format!("buy blocked by market sell | {upstream}")).with_confidence(conf);
                }
                Decision { confidence: clamp_confidence(conf), ..valuation.clone() }
            }
            Action::Hold => Decision::hold(format!("no actionable signal | {upstream}")).with_confidence(conf),
        }
    }
}
