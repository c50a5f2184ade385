use finmem_models::{DayInput, Decision, ReflectionSchedule, Tier};

use crate::assembler::DecisionContext;

/// Decides on which days the reflection step runs.
pub trait ReflectionPolicy: Send + Sync {
    fn should_reflect(&self, input: &DayInput) -> bool;
}

impl ReflectionPolicy for ReflectionSchedule {
    fn should_reflect(&self, input: &DayInput) -> bool {
        match self {
            ReflectionSchedule::Never => false,
            ReflectionSchedule::EveryNDays { n } => *n > 0 && (input.day + 1) % n == 0,
            ReflectionSchedule::OnMomentum { threshold } => input
                .momentum
                .is_some_and(|m| m.cumulative_return.abs() >= *threshold),
        }
    }
}

/// Text of the reflection memory for a decision, combining its rationale with
/// the short- and mid-term memories it cited. `None` when the decision failed
/// or carries no rationale.
pub fn reflection_text(decision: &Decision, context: &DecisionContext) -> Option<String> {
    if decision.is_failed() || decision.rationale.trim().is_empty() {
        return None;
    }

    let mut text = format!(
        "{} {} on {}: {}",
        decision.symbol,
        decision.action.as_str(),
        context.date,
        decision.rationale.trim()
    );

    let supporting: Vec<&str> = [Tier::Short, Tier::Mid]
        .iter()
        .flat_map(|tier| decision.citations.get(tier).into_iter().flatten())
        .filter_map(|index| context.memory(*index))
        .map(|memory| memory.text.as_str())
        .collect();
    if !supporting.is_empty() {
        text.push_str(" Supporting memories: ");
        text.push_str(&supporting.join(" | "));
    }
    Some(text)
}
