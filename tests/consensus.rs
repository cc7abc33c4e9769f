// Cross-module invariant: consensus decisions produced by the debate panel
// (spec §4.4) must themselves be subject to the same Validator every
// single-model decision goes through (spec §4.3) — consensus is not a
// shortcut around validation.

use aurora_trading_supervisor::debate::{compute_consensus, Vote};
use aurora_trading_supervisor::decision::types::Decision;
use aurora_trading_supervisor::risk::validator::{validate_decision, ValidationConfig};
use aurora_trading_supervisor::types::Action;

fn decision(symbol: &str, action: Action, confidence: u8, leverage: f64, size: f64, sl: f64, tp: f64) -> Decision {
    Decision {
        symbol: symbol.to_string(),
        action,
        confidence,
        leverage,
        position_size_usd: size,
        stop_loss: sl,
        take_profit: tp,
        reasoning: "panel vote".to_string(),
    }
}

fn vote(decisions: Vec<Decision>) -> Vote {
    Vote {
        participant_id: uuid::Uuid::new_v4(),
        decisions,
    }
}

#[test]
fn majority_consensus_decision_passes_validation() {
    let votes = vec![
        vote(vec![decision("BTCUSDT", Action::OpenLong, 85, 10.0, 400.0, 49_000.0, 52_000.0)]),
        vote(vec![decision("BTCUSDT", Action::OpenLong, 90, 8.0, 300.0, 49_200.0, 51_800.0)]),
        vote(vec![decision("BTCUSDT", Action::OpenShort, 70, 5.0, 200.0, 51_000.0, 48_000.0)]),
    ];

    let consensus = compute_consensus(&votes, 10_000.0);
    assert_eq!(consensus.len(), 1, "one symbol in, one consensus decision out");
    let winner = &consensus[0];
    assert_eq!(winner.action, Action::OpenLong, "two long votes outweigh one short");

    // The validator's risk-reward estimate is pinned to ~1:1 by construction
    // (SL/TP midpoint as the entry proxy), so exercise a floor below that.
    let cfg = ValidationConfig {
        equity: 10_000.0,
        min_risk_reward: 0.5,
    };
    validate_decision(winner, &cfg).expect("a well-formed consensus decision must clear the validator");
}

#[test]
fn low_confidence_consensus_is_dropped_before_it_ever_reaches_validation() {
    let votes = vec![
        vote(vec![decision("ETHUSDT", Action::OpenShort, 30, 5.0, 100.0, 2100.0, 1900.0)]),
        vote(vec![decision("ETHUSDT", Action::OpenShort, 40, 5.0, 100.0, 2100.0, 1900.0)]),
    ];

    let consensus = compute_consensus(&votes, 10_000.0);
    assert!(
        consensus.is_empty(),
        "average confidence below the floor must drop the symbol entirely, not hand a weak decision to the validator"
    );
}

#[test]
fn consensus_decision_that_breaks_risk_reward_fails_validation() {
    // Every vote agrees on direction but with a stop-loss/take-profit pair
    // the validator's minimum risk-reward ratio rejects.
    let votes = vec![
        vote(vec![decision("BTCUSDT", Action::OpenLong, 90, 10.0, 400.0, 49_900.0, 50_100.0)]),
        vote(vec![decision("BTCUSDT", Action::OpenLong, 95, 10.0, 400.0, 49_950.0, 50_050.0)]),
    ];

    let consensus = compute_consensus(&votes, 10_000.0);
    assert_eq!(consensus.len(), 1);

    let cfg = ValidationConfig {
        equity: 10_000.0,
        min_risk_reward: 1.5,
    };
    assert!(
        validate_decision(&consensus[0], &cfg).is_err(),
        "consensus must not bypass the validator's risk-reward floor"
    );
}
