use finmem_models::{RunMode, Tier};
use serde_json::{json, Map, Value};

use crate::assembler::DecisionContext;

const TEST_ACTION_DESC: &str = "Given the information, make an investment decision: \
     buy the stock, sell the stock, or hold.";
const TEST_REASON_DESC: &str = "Given the news, the memories and the summary of the price \
     movement, explain why you made this investment decision.";
const WARMUP_REASON_DESC: &str = "Given the realised price movement, explain why a \
     professional trader would have made this trade using the information provided.";

fn memory_ids_desc(tier: Tier, mode: RunMode) -> String {
    match mode {
        RunMode::Warmup => format!(
            "memory_index values of the {tier}-term memories most related to the realised \
             price movement."
        ),
        RunMode::Test => format!(
            "memory_index values of the {tier}-term memories most related to your investment \
             decision."
        ),
    }
}

/// System prompt for the decision step.
pub fn decision_system_prompt(mode: RunMode, character: &str) -> String {
    let task = match mode {
        RunMode::Warmup => {
            "You are reviewing a historical trading day. The realised next-day price \
             movement is given. Explain what drove it, citing the memories that support \
             your explanation."
        }
        RunMode::Test => {
            "Decide whether to buy, sell or hold the stock today. Weigh the recent news, \
             the price momentum and the memories provided, and cite the memories that \
             support your decision."
        }
    };
    format!(
        "You are a trading agent with a layered memory.\n\
         Investor profile: {character}\n\n\
         ## TASK\n\n{task}\n\n\
         ## CITATIONS\n\n\
         Every memory is labelled with a memory_index. Cite memories only by the \
         memory_index shown, and only in the id list of the layer it was listed under. \
         Do not invent indices."
    )
}

/// Machine-readable description of the expected response, including the
/// indices that may be cited under each tier.
pub fn decision_schema(mode: RunMode, context: &DecisionContext) -> Value {
    let mut properties = Map::new();
    let mut required = vec![Value::from("summary_reason")];

    if mode == RunMode::Test {
        properties.insert(
            "investment_decision".to_string(),
            json!({
                "type": "string",
                "enum": ["buy", "sell", "hold"],
                "description": TEST_ACTION_DESC,
            }),
        );
        required.insert(0, Value::from("investment_decision"));
    }
    let reason_desc = match mode {
        RunMode::Warmup => WARMUP_REASON_DESC,
        RunMode::Test => TEST_REASON_DESC,
    };
    properties.insert(
        "summary_reason".to_string(),
        json!({"type": "string", "minLength": 1, "description": reason_desc}),
    );

    for tier in Tier::ALL {
        let offered = context.citations.offered(tier);
        if offered.is_empty() {
            continue;
        }
        properties.insert(
            tier.citation_field().to_string(),
            json!({
                "type": "array",
                "uniqueItems": true,
                "items": {"type": "integer", "enum": offered},
                "description": memory_ids_desc(tier, mode),
            }),
        );
    }

    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// The user prompt for one symbol-day.
pub fn format_decision_prompt(mode: RunMode, context: &DecisionContext) -> String {
    let mut prompt = format!(
        "Symbol: {}\nDate: {}\nClose price: {}\n",
        context.symbol, context.date, context.price
    );

    match context.momentum {
        Some(momentum) => prompt.push_str(&format!(
            "Momentum: cumulative return of {:+.4} over the last {} day(s) ({:?}).\n",
            momentum.cumulative_return,
            momentum.window,
            momentum.direction()
        )),
        None => prompt.push_str("Momentum: not enough history yet.\n"),
    }

    if mode == RunMode::Warmup {
        match context.future_return {
            Some(ret) => prompt.push_str(&format!("Realised next-day return: {ret:+.4}\n")),
            None => prompt.push_str("Realised next-day return: unknown\n"),
        }
    }

    if !context.news.is_empty() {
        prompt.push_str("\n## TODAY'S NEWS\n");
        for item in &context.news {
            prompt.push_str(&format!("- {item}\n"));
        }
    }

    for tier in Tier::ALL {
        let mut memories = context.memories_in(tier).peekable();
        if memories.peek().is_none() {
            continue;
        }
        prompt.push_str(&format!("\n## {}-TERM MEMORY\n", tier.as_str().to_uppercase()));
        for memory in memories {
            prompt.push_str(&format!(
                "[memory_index {}] {}\n",
                memory.memory_index, memory.text
            ));
        }
    }

    prompt
}
