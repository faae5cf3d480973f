//! 计划与反思的值类型
//!
//! 计划是值对象：细化要么整体替换，要么只替换当前下标及之后的步骤，已执行的前缀不变。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::AgentError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanStep {
    pub id: u32,
    pub description: String,
    /// 为空表示思考步骤（调用推理能力）
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default = "empty_args")]
    pub tool_args: Value,
}

fn empty_args() -> Value {
    json!({})
}

impl PlanStep {
    pub fn thinking(id: u32, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            tool: None,
            tool_args: empty_args(),
        }
    }

    pub fn tool(id: u32, description: impl Into<String>, tool: impl Into<String>, args: Value) -> Self {
        Self {
            id,
            description: description.into(),
            tool: Some(tool.into()),
            tool_args: args,
        }
    }

    /// 宽松解析单个步骤；缺省 id 为 position，描述为 "Step {position}"，参数为 {}
    fn from_value(value: &Value, position: u32) -> Self {
        let id = value
            .get("id")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(position);
        let description = value
            .get("description")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("Step {}", position));
        let tool = value
            .get("tool")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(String::from);
        let tool_args = match value.get("tool_args") {
            Some(v) if v.is_object() => v.clone(),
            _ => empty_args(),
        };
        Self {
            id,
            description,
            tool,
            tool_args,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Plan {
    pub id: String,
    pub goal: String,
    pub thought: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    pub steps: Vec<PlanStep>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn new(goal: impl Into<String>, thought: impl Into<String>, steps: Vec<PlanStep>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            thought: thought.into(),
            reasoning: None,
            steps,
            created_at: Utc::now(),
        }
    }

    /// 把模型输出归一化为计划；不是对象或没有任何步骤时视为解析失败
    pub fn from_llm(value: &Value, goal: &str) -> Result<Self, AgentError> {
        if !value.is_object() {
            return Err(AgentError::JsonParseError(format!(
                "plan is not an object: {}",
                value
            )));
        }
        let steps = normalize_steps(value.get("steps"), 0);
        if steps.is_empty() {
            return Err(AgentError::JsonParseError(
                "plan contains no steps".to_string(),
            ));
        }
        let goal = value
            .get("goal")
            .and_then(Value::as_str)
            .filter(|g| !g.trim().is_empty())
            .unwrap_or(goal);
        let thought = value
            .get("thought")
            .and_then(Value::as_str)
            .unwrap_or("No initial reasoning provided");
        Ok(Self::new(goal, thought, steps))
    }

    /// 通用三步计划：分析 → 检索 → 总结
    pub fn fallback(goal: &str) -> Self {
        Self::new(
            goal,
            "Failed to create a detailed plan. Using fallback simple plan.",
            vec![
                PlanStep::thinking(1, format!("Analyze the goal: {}", goal)),
                PlanStep::tool(
                    2,
                    "Search for relevant information",
                    "web_search",
                    json!({ "query": goal, "num_results": 3 }),
                ),
                PlanStep::thinking(3, "Summarize findings and report results"),
            ],
        )
    }

    /// 保留 [0, from) 的前缀，之后替换为 tail
    pub fn with_tail(&self, from: usize, tail: Vec<PlanStep>) -> Self {
        let keep = from.min(self.steps.len());
        let mut plan = self.clone();
        plan.steps.truncate(keep);
        plan.steps.extend(tail);
        plan
    }

    /// 把细化结果接在已执行的前 executed 步之后。
    ///
    /// refined 原样保留了这段前缀时只取其后的步骤，否则它的全部步骤都视为新的尾部。
    /// 尾部 id 从 executed + 1 起连续编号；id、goal 与前缀不变，thought/reasoning 取细化后的。
    pub fn splice_refinement(&self, executed: usize, refined: Plan) -> Self {
        let keep = executed.min(self.steps.len());
        let keeps_prefix =
            refined.steps.len() >= keep && refined.steps[..keep] == self.steps[..keep];
        let tail = if keeps_prefix {
            refined.steps[keep..].to_vec()
        } else {
            refined.steps
        };
        let tail = tail
            .into_iter()
            .enumerate()
            .map(|(i, mut step)| {
                step.id = (keep + i + 1) as u32;
                step
            })
            .collect();

        let mut plan = self.with_tail(keep, tail);
        plan.thought = refined.thought;
        plan.reasoning = refined.reasoning.or(plan.reasoning);
        plan
    }
}

/// 缺省 id 从 offset + 1 开始按位置编号
pub fn normalize_steps(steps: Option<&Value>, offset: usize) -> Vec<PlanStep> {
    steps
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .enumerate()
                .map(|(i, v)| PlanStep::from_value(v, (offset + i + 1) as u32))
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reflection {
    pub success: bool,
    pub reasoning: String,
    pub learning: String,
    #[serde(default)]
    pub next_steps: Vec<String>,
}

impl Reflection {
    pub fn from_llm(value: &Value) -> Result<Self, AgentError> {
        if !value.is_object() {
            return Err(AgentError::JsonParseError(format!(
                "reflection is not an object: {}",
                value
            )));
        }
        let text = |key: &str| {
            value
                .get(key)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    Value::Null => String::new(),
                    other => other.to_string(),
                })
                .unwrap_or_default()
        };
        let next_steps = value
            .get("next_steps")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .map(|v| v.as_str().map(String::from).unwrap_or_else(|| v.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            success: value.get("success").and_then(Value::as_bool).unwrap_or(false),
            reasoning: text("reasoning"),
            learning: text("learning"),
            next_steps,
        })
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            reasoning: format!("Failed to reflect on task: {}", error),
            learning: "No learning could be generated due to an error.".to_string(),
            next_steps: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_fills_defaults() {
        let raw = json!({
            "steps": [
                {"description": "look", "tool": "echo", "tool_args": {"text": "x"}},
                {"tool": ""},
                {"id": 7, "description": "think", "tool_args": "bad"}
            ]
        });
        let plan = Plan::from_llm(&raw, "the goal").unwrap();
        assert_eq!(plan.goal, "the goal");
        assert_eq!(plan.thought, "No initial reasoning provided");
        assert_eq!(plan.steps[0].id, 1);
        assert_eq!(plan.steps[0].tool.as_deref(), Some("echo"));
        assert_eq!(plan.steps[1].description, "Step 2");
        assert_eq!(plan.steps[1].tool, None);
        assert_eq!(plan.steps[2].id, 7);
        assert_eq!(plan.steps[2].tool_args, json!({}));
    }

    #[test]
    fn test_empty_plan_is_parse_error() {
        assert!(Plan::from_llm(&json!({"goal": "x", "steps": []}), "x").is_err());
        assert!(Plan::from_llm(&json!("text"), "x").is_err());
    }

    #[test]
    fn test_fallback_shape() {
        let plan = Plan::fallback("find rust jobs");
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[0].description, "Analyze the goal: find rust jobs");
        assert_eq!(plan.steps[1].tool.as_deref(), Some("web_search"));
        assert_eq!(
            plan.steps[1].tool_args,
            json!({"query": "find rust jobs", "num_results": 3})
        );
        assert!(plan.steps[2].tool.is_none());
    }

    #[test]
    fn test_with_tail_keeps_prefix() {
        let plan = Plan::fallback("g");
        let refined = plan.with_tail(1, vec![PlanStep::thinking(2, "new")]);
        assert_eq!(refined.steps.len(), 2);
        assert_eq!(refined.steps[0], plan.steps[0]);
        assert_eq!(refined.steps[1].description, "new");
        assert_eq!(refined.id, plan.id);
    }

    #[test]
    fn test_splice_refinement() {
        let plan = Plan::new(
            "g",
            "t",
            vec![PlanStep::thinking(1, "done"), PlanStep::thinking(2, "stale")],
        );

        // 细化结果带着同一前缀：只取其后的步骤
        let mut tail_only = plan.with_tail(1, vec![PlanStep::thinking(9, "next")]);
        tail_only.thought = "adjusted".into();
        let spliced = plan.splice_refinement(1, tail_only);
        assert_eq!(spliced.steps[0], plan.steps[0]);
        assert_eq!(spliced.steps[1].id, 2);
        assert_eq!(spliced.steps[1].description, "next");
        assert_eq!(spliced.thought, "adjusted");

        // 全新计划：整份步骤接在前缀之后
        let fresh = Plan::new("other", "again", vec![PlanStep::thinking(1, "x"), PlanStep::thinking(2, "y")]);
        let spliced = plan.splice_refinement(1, fresh);
        assert_eq!(spliced.id, plan.id);
        assert_eq!(spliced.goal, "g");
        assert_eq!(
            spliced.steps.iter().map(|s| (s.id, s.description.as_str())).collect::<Vec<_>>(),
            vec![(1, "done"), (2, "x"), (3, "y")]
        );

        // 未变化的计划原样保留
        assert_eq!(plan.splice_refinement(1, plan.clone()), plan);
    }

    #[test]
    fn test_reflection_parsing_and_failure() {
        let r = Reflection::from_llm(&json!({
            "success": true,
            "reasoning": "went fine",
            "learning": "cache more",
            "next_steps": ["a", 2]
        }))
        .unwrap();
        assert!(r.success);
        assert_eq!(r.next_steps, vec!["a", "2"]);

        let f = Reflection::failed("boom");
        assert!(!f.success);
        assert_eq!(f.reasoning, "Failed to reflect on task: boom");
        assert!(f.next_steps.is_empty());
    }
}
