use evalexpr::{eval_boolean_with_context, ContextWithMutableVariables, HashMapContext, Value as ExprValue};
use jsonschema::{Draft, JSONSchema};
use regex::{Regex, RegexBuilder};
use serde_json::Value;

use super::{CriterionSpec, EvalContext, EvaluationError, Evaluator, Observation, ReplyScope};
use crate::conversation::{ConversationRecord, TerminalState, ToolCall, ToolResult};

pub(super) fn register_builtins(evaluator: &mut Evaluator) {
    evaluator.register("goal_achieved", goal_achieved);
    evaluator.register("products_shown", products_shown);
    evaluator.register("price_filter_used", price_filter_used);
    evaluator.register("error_handled_gracefully", error_handled_gracefully);
    evaluator.register("tracking_checked", tracking_checked);
    evaluator.register("order_created", order_created);
    evaluator.register("no_tool_errors", no_tool_errors);
}

/// `true` when every key of `expected` is present in `actual` with a
/// matching value, recursively for objects. Non-object values must be equal.
pub fn value_is_subset(expected: &Value, actual: &Value) -> bool {
    let (Value::Object(expected), Value::Object(actual)) = (expected, actual) else {
        return expected == actual;
    };
    expected
        .iter()
        .all(|(k, v)| actual.get(k).is_some_and(|av| value_is_subset(v, av)))
}

fn calls_to<'r>(
    record: &'r ConversationRecord,
    names: &'r [String],
) -> impl Iterator<Item = &'r ToolCall> + 'r {
    record
        .tool_calls()
        .map(|(_, call)| call)
        .filter(move |call| names.iter().any(|name| name == &call.name))
}

fn goal_achieved(ctx: &EvalContext<'_>) -> Result<Observation, EvaluationError> {
    let state = ctx.record.terminal_state();
    Ok(Observation::new(
        state == Some(TerminalState::GoalAchieved),
        match state {
            Some(state) => format!("terminal state is {state}"),
            None => "no terminal state".to_string(),
        },
    ))
}

/// Non-empty payload, looking inside the usual list envelopes.
fn has_items(payload: &Value) -> bool {
    match payload {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => {
            for key in ["items", "products", "results", "data"] {
                if let Some(Value::Array(items)) = map.get(key) {
                    return !items.is_empty();
                }
            }
            !map.is_empty()
        }
        Value::String(text) => !text.trim().is_empty(),
        _ => true,
    }
}

fn products_shown(ctx: &EvalContext<'_>) -> Result<Observation, EvaluationError> {
    let mut calls = 0;
    for call in calls_to(ctx.record, &ctx.config.product_tools) {
        calls += 1;
        if let ToolResult::Ok { payload } = &call.result {
            if has_items(payload) {
                return Ok(Observation::new(
                    true,
                    format!("{} returned products", call.name),
                ));
            }
        }
    }
    let rationale = if calls == 0 {
        "no product listing tool was called".to_string()
    } else {
        format!("{calls} product listing call(s), none returned products")
    };
    Ok(Observation::new(false, rationale))
}

fn find_key<'v>(value: &'v Value, keys: &[String]) -> Option<(&'v str, &'v Value)> {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                if keys.iter().any(|k| k == key) && !nested.is_null() {
                    return Some((key.as_str(), nested));
                }
            }
            map.values().find_map(|nested| find_key(nested, keys))
        }
        Value::Array(items) => items.iter().find_map(|nested| find_key(nested, keys)),
        _ => None,
    }
}

fn price_filter_used(ctx: &EvalContext<'_>) -> Result<Observation, EvaluationError> {
    let found = calls_to(ctx.record, &ctx.config.product_tools).find_map(|call| {
        find_key(&call.arguments, &ctx.config.price_filter_keys).map(|(key, value)| (call, key, value))
    });
    Ok(match found {
        Some((call, key, value)) => {
            Observation::new(true, format!("{} called with {key}={value}", call.name))
        }
        None => Observation::new(false, "no product call carried a price filter"),
    })
}

fn error_handled_gracefully(ctx: &EvalContext<'_>) -> Result<Observation, EvaluationError> {
    let record = ctx.record;
    if record.terminal_state() == Some(TerminalState::Error) {
        return Ok(Observation::new(false, "run ended in error"));
    }
    let failed_turns: Vec<usize> = record
        .turns
        .iter()
        .filter(|turn| turn.tool_calls.iter().any(ToolCall::is_err))
        .map(|turn| turn.index)
        .collect();
    if failed_turns.is_empty() {
        return Ok(Observation::new(true, "no tool errors occurred"));
    }

    let apology = RegexBuilder::new(&ctx.config.apology_pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| EvaluationError::predicate("error_handled_gracefully", e))?;

    for index in &failed_turns {
        let acknowledged = record
            .manager_turns()
            .filter(|turn| turn.index >= *index)
            .any(|turn| apology.is_match(&turn.message));
        if !acknowledged {
            return Ok(Observation::new(
                false,
                format!("tool failure in turn {index} was never acknowledged to the customer"),
            ));
        }
    }
    Ok(Observation::new(
        true,
        format!("{} tool failure(s) acknowledged", failed_turns.len()),
    ))
}

fn tracking_checked(ctx: &EvalContext<'_>) -> Result<Observation, EvaluationError> {
    let count = calls_to(ctx.record, &ctx.config.tracking_tools).count();
    Ok(Observation::new(
        count > 0,
        format!("{count} order tracking call(s)"),
    ))
}

fn order_created(ctx: &EvalContext<'_>) -> Result<Observation, EvaluationError> {
    let created = calls_to(ctx.record, &ctx.config.order_tools).find(|call| !call.is_err());
    Ok(match created {
        Some(call) => Observation::new(true, format!("{} succeeded", call.name)),
        None => Observation::new(false, "no successful order creation"),
    })
}

fn no_tool_errors(ctx: &EvalContext<'_>) -> Result<Observation, EvaluationError> {
    let errors = ctx.record.tool_error_count();
    Ok(Observation::new(errors == 0, format!("{errors} tool error(s)")))
}

impl CriterionSpec {
    pub(super) fn observe(
        &self,
        criterion: &str,
        ctx: &EvalContext<'_>,
    ) -> Result<Observation, EvaluationError> {
        let record = ctx.record;
        match self {
            CriterionSpec::ToolInvoked {
                tool,
                min_calls,
                successful_only,
            } => {
                let count = record
                    .tool_calls()
                    .filter(|(_, call)| &call.name == tool && (!successful_only || !call.is_err()))
                    .count();
                Ok(Observation::new(
                    count >= *min_calls,
                    format!("{tool} called {count} time(s), need {min_calls}"),
                ))
            }
            CriterionSpec::ToolArguments {
                tool,
                subset,
                schema,
            } => {
                if subset.is_none() && schema.is_none() {
                    return Err(EvaluationError::predicate(
                        criterion,
                        "tool_arguments needs `subset` or `schema`",
                    ));
                }
                let compiled = match schema {
                    Some(schema) => Some(
                        JSONSchema::options()
                            .with_draft(Draft::Draft7)
                            .compile(schema)
                            .map_err(|e| EvaluationError::predicate(criterion, e))?,
                    ),
                    None => None,
                };

                let matching = record.tool_calls().find(|(_, call)| {
                    &call.name == tool
                        && subset
                            .as_ref()
                            .map_or(true, |subset| value_is_subset(subset, &call.arguments))
                        && compiled
                            .as_ref()
                            .map_or(true, |schema| schema.is_valid(&call.arguments))
                });
                Ok(match matching {
                    Some((turn, _)) => Observation::new(
                        true,
                        format!("{tool} arguments matched in turn {}", turn.index),
                    ),
                    None => Observation::new(false, format!("no {tool} call with matching arguments")),
                })
            }
            CriterionSpec::ReplyMatches { pattern, scope } => {
                let regex = Regex::new(pattern).map_err(|e| EvaluationError::predicate(criterion, e))?;
                let hit = match scope {
                    ReplyScope::Final => record
                        .final_manager_reply()
                        .filter(|turn| regex.is_match(&turn.message)),
                    ReplyScope::Any => record.manager_turns().find(|turn| regex.is_match(&turn.message)),
                };
                Ok(match hit {
                    Some(turn) => Observation::new(true, format!("turn {} matches /{pattern}/", turn.index)),
                    None => Observation::new(false, format!("no manager reply matches /{pattern}/")),
                })
            }
            CriterionSpec::MaxTurns { limit } => {
                let replies = record.manager_turns().count();
                Ok(Observation::new(
                    replies <= *limit,
                    format!("{replies} manager replies, limit {limit}"),
                ))
            }
            CriterionSpec::TerminalState { state } => {
                let actual = record.terminal_state();
                Ok(Observation::new(
                    actual == Some(*state),
                    match actual {
                        Some(actual) => format!("terminal state is {actual}"),
                        None => "no terminal state".to_string(),
                    },
                ))
            }
            CriterionSpec::Expression { expr } => {
                let context = expression_context(record)
                    .map_err(|e| EvaluationError::predicate(criterion, e))?;
                let value = eval_boolean_with_context(expr, &context)
                    .map_err(|e| EvaluationError::predicate(criterion, e))?;
                Ok(Observation::new(value, format!("`{expr}` is {value}")))
            }
        }
    }
}

fn expression_context(record: &ConversationRecord) -> Result<HashMapContext, evalexpr::EvalexprError> {
    let count = |n: usize| ExprValue::Int(n as i64);
    let mut context: HashMapContext = HashMapContext::new();
    context.set_value("turns".into(), count(record.turns.len()))?;
    context.set_value("manager_turns".into(), count(record.manager_turns().count()))?;
    context.set_value("client_turns".into(), count(record.client_turns().count()))?;
    context.set_value("tool_calls".into(), count(record.tool_calls().count()))?;
    context.set_value("tool_errors".into(), count(record.tool_error_count()))?;
    context.set_value(
        "duration_secs".into(),
        ExprValue::Float(record.duration_ms as f64 / 1000.0),
    )?;
    context.set_value(
        "goal_achieved".into(),
        ExprValue::Boolean(record.terminal_state() == Some(TerminalState::GoalAchieved)),
    )?;
    context.set_value(
        "total_tokens".into(),
        ExprValue::Int(record.usage.total_tokens() as i64),
    )?;
    Ok(context)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        conversation::{Speaker, Turn},
        error::ToolExecutionError,
        evaluator::EvaluatorConfig,
        scenario::Scenario,
    };

    fn scenario() -> Scenario {
        serde_json::from_value(json!({
            "id": "s",
            "name": "s",
            "persona": "p",
            "initial_message": "hi"
        }))
        .expect("scenario")
    }

    fn record_with(calls: Vec<ToolCall>, reply: &str) -> ConversationRecord {
        let mut record = ConversationRecord::new("r", "s", "v");
        record.push_turn(Turn::new(0, Speaker::Client, "hi")).unwrap();
        record
            .push_turn(Turn::new(1, Speaker::Manager, reply).with_tool_calls(calls))
            .unwrap();
        record.finalize(TerminalState::GoalAchieved, None, 2_500, 0.0).unwrap();
        record
    }

    fn observe(spec: &CriterionSpec, record: &ConversationRecord) -> Result<Observation, EvaluationError> {
        let scenario = scenario();
        let config = EvaluatorConfig::default();
        spec.observe(
            "custom",
            &EvalContext {
                scenario: &scenario,
                record,
                config: &config,
            },
        )
    }

    #[test]
    fn subset_matching_is_recursive() {
        let actual = json!({"filters": {"max_price": 10000, "color": "red"}, "limit": 5});
        assert!(value_is_subset(&json!({"filters": {"max_price": 10000}}), &actual));
        assert!(!value_is_subset(&json!({"filters": {"max_price": 9000}}), &actual));
        assert!(!value_is_subset(&json!({"missing": 1}), &actual));
    }

    #[test]
    fn price_filter_found_in_nested_arguments() {
        let record = record_with(
            vec![ToolCall::new(
                "search_products",
                json!({"query": "bouquet", "filters": [{"price_to": 10000}]}),
                ToolResult::ok(json!({"items": []})),
            )],
            "nothing in stock",
        );
        let scenario = scenario();
        let config = EvaluatorConfig::default();
        let ctx = EvalContext {
            scenario: &scenario,
            record: &record,
            config: &config,
        };

        assert!(price_filter_used(&ctx).unwrap().value);
        let shown = products_shown(&ctx).unwrap();
        assert!(!shown.value);
        assert!(shown.rationale.contains("none returned products"));
    }

    #[test]
    fn apology_in_later_turn_counts() {
        let mut record = ConversationRecord::new("r", "s", "v");
        record.push_turn(Turn::new(0, Speaker::Client, "where is X1?")).unwrap();
        record
            .push_turn(Turn::new(1, Speaker::Manager, "checking").with_tool_calls(vec![ToolCall::new(
                "track_order",
                json!({"order_id": "X1"}),
                ToolResult::err(ToolExecutionError::new("not found")),
            )]))
            .unwrap();
        record.push_turn(Turn::new(2, Speaker::Client, "?")).unwrap();
        record
            .push_turn(Turn::new(3, Speaker::Manager, "К сожалению, заказ не найден"))
            .unwrap();
        record.finalize(TerminalState::GoalAchieved, None, 0, 0.0).unwrap();

        let scenario = scenario();
        let config = EvaluatorConfig::default();
        let ctx = EvalContext {
            scenario: &scenario,
            record: &record,
            config: &config,
        };
        assert!(error_handled_gracefully(&ctx).unwrap().value);
        assert!(tracking_checked(&ctx).unwrap().value);
        assert!(!no_tool_errors(&ctx).unwrap().value);
    }

    #[test]
    fn tool_arguments_checks_schema() {
        let record = record_with(
            vec![ToolCall::new(
                "create_order",
                json!({"product_id": 7, "quantity": 1}),
                ToolResult::ok(json!({"order_id": "A1"})),
            )],
            "Заказ оформлен",
        );
        let spec = CriterionSpec::ToolArguments {
            tool: "create_order".into(),
            subset: None,
            schema: Some(json!({
                "type": "object",
                "required": ["product_id", "quantity"],
                "properties": {"quantity": {"type": "integer", "minimum": 1}}
            })),
        };
        assert!(observe(&spec, &record).unwrap().value);

        let strict = CriterionSpec::ToolArguments {
            tool: "create_order".into(),
            subset: Some(json!({"quantity": 2})),
            schema: None,
        };
        assert!(!observe(&strict, &record).unwrap().value);

        let empty = CriterionSpec::ToolArguments {
            tool: "create_order".into(),
            subset: None,
            schema: None,
        };
        assert!(observe(&empty, &record).is_err());
    }

    #[test]
    fn expressions_see_run_variables() {
        let record = record_with(Vec::new(), "hello");
        let spec = CriterionSpec::Expression {
            expr: "goal_achieved && turns == 2 && duration_secs < 3".into(),
        };
        assert!(observe(&spec, &record).unwrap().value);

        let broken = CriterionSpec::Expression {
            expr: "turns +".into(),
        };
        assert!(matches!(
            observe(&broken, &record),
            Err(EvaluationError::Predicate { .. })
        ));
    }

    #[test]
    fn reply_scope_limits_search() {
        let mut record = ConversationRecord::new("r", "s", "v");
        record.push_turn(Turn::new(0, Speaker::Client, "hi")).unwrap();
        record.push_turn(Turn::new(1, Speaker::Manager, "Roses cost 9000")).unwrap();
        record.push_turn(Turn::new(2, Speaker::Client, "ok")).unwrap();
        record.push_turn(Turn::new(3, Speaker::Manager, "Thanks!")).unwrap();
        record.finalize(TerminalState::GoalAchieved, None, 0, 0.0).unwrap();

        let final_only = CriterionSpec::ReplyMatches {
            pattern: r"\d{4}".into(),
            scope: ReplyScope::Final,
        };
        let any = CriterionSpec::ReplyMatches {
            pattern: r"\d{4}".into(),
            scope: ReplyScope::Any,
        };
        assert!(!observe(&final_only, &record).unwrap().value);
        assert!(observe(&any, &record).unwrap().value);
    }
}
