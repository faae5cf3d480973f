//! 规划器
//!
//! - create_plan：请求结构化计划；任何失败（供应商错误、解析失败、空计划）都回退到通用三步计划
//! - refine_plan：返回完整新计划（含 steps 与 goal）或只替换当前下标之后的步骤（next_steps）；失败时原样返回
//! - reflect_on_task：生成 {success, reasoning, learning, next_steps}；失败时返回默认的"无法反思"记录
//!
//! 计划与细化结果写入短期任务记忆，反思写入长期记忆；记忆写入失败只记日志。

use std::sync::Arc;

use serde_json::{json, Value};

use crate::agent::{normalize_steps, Plan, Reflection, StepResult, TaskScope};
use crate::core::{AgentError, RecoveryEngine};
use crate::llm::{LlmClient, Message};
use crate::memory::{AgentContext, AgentMemory, Metadata};

const PLANNING_SYSTEM_PROMPT: &str = "You are an autonomous agent tasked with planning how to achieve a goal.
Given a goal, create a step-by-step plan to achieve it.

You have the following tools available:
{tools}

Consider:
1. What information you need to gather
2. What actions to take and in what order
3. How to handle potential errors or edge cases

Respond with a JSON object containing the following fields:
{
  \"goal\": \"the overall goal\",
  \"thought\": \"your reasoning about the approach\",
  \"steps\": [
    {\"id\": 1, \"description\": \"specific action to take\", \"tool\": \"optional tool name\", \"tool_args\": {}}
  ]
}";

const REFINE_SYSTEM_PROMPT: &str = "You are an autonomous agent refining a plan based on new information.
Analyze the execution result of the current step and decide whether the plan needs adjustment.

Respond with either a complete new plan:
{\"goal\": \"the goal\", \"thought\": \"your new reasoning\", \"steps\": [step objects]}
or only the modified parts:
{\"reasoning\": \"why changes are needed\", \"next_steps\": [steps replacing the remaining ones]}";

const REFLECT_SYSTEM_PROMPT: &str = "You are an autonomous agent reflecting on a completed task.
Analyze the execution and results of the task to generate insights.

Respond with a JSON object containing the following fields:
{
  \"success\": boolean indicating overall success,
  \"reasoning\": \"your analysis of what went well and what didn't\",
  \"learning\": \"key lessons or insights from this task\",
  \"next_steps\": [\"suggestions for follow-up actions or improvements\"]
}";

pub struct Planner {
    llm: Arc<dyn LlmClient>,
    memory: Option<Arc<AgentMemory>>,
    recovery: RecoveryEngine,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            memory: None,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn with_memory(mut self, memory: Arc<AgentMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// 不带回退的规划，错误显式返回
    pub async fn try_create_plan(&self, goal: &str, context: &AgentContext) -> Result<Plan, AgentError> {
        let messages = planning_messages(goal, context);
        let raw = self.llm.generate_json(&messages).await?;
        Plan::from_llm(&raw, goal)
    }

    pub async fn create_plan(&self, scope: &TaskScope, goal: &str, context: &AgentContext) -> Plan {
        let plan = match self.try_create_plan(goal, context).await {
            Ok(plan) => plan,
            Err(e) => {
                let action = self.recovery.classify_agent(&e);
                tracing::warn!(task_id = %scope.task_id, error = %e, ?action, "planning failed, using fallback plan");
                Plan::fallback(goal)
            }
        };

        let mut extra = Metadata::new();
        extra.insert("goal".into(), json!(goal));
        self.remember(scope, "plan", &plan, extra).await;
        plan
    }

    /// 只在调用方显式要求自适应重规划时使用；current_step 为下一个待执行步骤的下标
    pub async fn refine_plan(
        &self,
        scope: &TaskScope,
        plan: &Plan,
        current_step: usize,
        last_result: Option<&StepResult>,
    ) -> Plan {
        let messages = refine_messages(plan, current_step, last_result);
        let refined = match self.llm.generate_json(&messages).await {
            Ok(raw) => apply_refinement(plan, current_step, &raw),
            Err(e) => Err(AgentError::from(e)),
        };

        match refined {
            Ok(refined) => {
                let mut extra = Metadata::new();
                extra.insert("goal".into(), json!(plan.goal));
                extra.insert("current_step".into(), json!(current_step));
                self.remember(scope, "refined_plan", &refined, extra).await;
                refined
            }
            Err(e) => {
                tracing::warn!(task_id = %scope.task_id, error = %e, "plan refinement failed, keeping current plan");
                plan.clone()
            }
        }
    }

    pub async fn reflect_on_task(
        &self,
        scope: &TaskScope,
        goal: &str,
        plan: &Plan,
        results: &[StepResult],
        context: &AgentContext,
    ) -> Reflection {
        let messages = reflection_messages(goal, plan, results, context);
        let reflection = match self.llm.generate_json(&messages).await {
            Ok(raw) => Reflection::from_llm(&raw),
            Err(e) => Err(AgentError::from(e)),
        };

        match reflection {
            Ok(reflection) => {
                if let Some(memory) = &self.memory {
                    let mut extra = Metadata::new();
                    extra.insert("goal".into(), json!(goal));
                    let payload = serde_json::to_value(&reflection).unwrap_or(Value::Null);
                    if let Err(e) = memory
                        .record_long_term(&scope.agent_id, Some(&scope.task_id), "reflection", payload, extra)
                        .await
                    {
                        tracing::warn!(task_id = %scope.task_id, error = %e, "failed to store reflection");
                    }
                }
                reflection
            }
            Err(e) => {
                tracing::warn!(task_id = %scope.task_id, error = %e, "reflection failed");
                Reflection::failed(e)
            }
        }
    }

    async fn remember(&self, scope: &TaskScope, kind: &str, plan: &Plan, extra: Metadata) {
        let Some(memory) = &self.memory else {
            return;
        };
        let payload = match serde_json::to_value(plan) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize plan");
                return;
            }
        };
        if let Err(e) = memory
            .record_task_memory(&scope.agent_id, &scope.task_id, kind, payload, extra)
            .await
        {
            tracing::warn!(task_id = %scope.task_id, kind, error = %e, "failed to store plan memory");
        }
    }
}

/// 含 steps 与 goal 时整体替换；含 next_steps 时替换 current_step 之后的尾部；thought / reasoning 同步更新
fn apply_refinement(plan: &Plan, current_step: usize, raw: &Value) -> Result<Plan, AgentError> {
    if raw.get("steps").is_some() && raw.get("goal").is_some() {
        return Plan::from_llm(raw, &plan.goal);
    }

    let mut refined = match raw.get("next_steps") {
        Some(next) => plan.with_tail(current_step, normalize_steps(Some(next), current_step)),
        None => plan.clone(),
    };
    if let Some(reasoning) = raw.get("reasoning").and_then(Value::as_str) {
        refined.reasoning = Some(reasoning.to_string());
    }
    if let Some(thought) = raw.get("thought").and_then(Value::as_str) {
        refined.thought = thought.to_string();
    }
    Ok(refined)
}

fn planning_messages(goal: &str, context: &AgentContext) -> Vec<Message> {
    let tools = if context.available_tools.is_empty() {
        "(none)".to_string()
    } else {
        context
            .available_tools
            .iter()
            .map(|t| format!("- {}: {}", t.name, t.description))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let system = PLANNING_SYSTEM_PROMPT.replace("{tools}", &tools);

    let mut user = format!("Goal: {}\n\n", goal);
    user.push_str(&context.memory_digest());

    vec![Message::system(system), Message::user(user)]
}

fn refine_messages(plan: &Plan, current_step: usize, last: Option<&StepResult>) -> Vec<Message> {
    let steps = serde_json::to_string_pretty(&plan.steps).unwrap_or_else(|_| "[]".into());
    let current = plan
        .steps
        .get(current_step)
        .map(|s| s.description.as_str())
        .unwrap_or("N/A");
    let result = last
        .and_then(|r| r.result.as_ref())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "N/A".into());
    let error = last
        .and_then(|r| r.error.clone())
        .unwrap_or_else(|| "None".into());

    let user = format!(
        "Goal: {}\n\nCurrent plan:\n{}\n\nCurrent step: {} - {}\n\nExecution result: {}\nError: {}\n\n\
         Should the plan be adjusted based on this information? If so, provide the updated plan or next steps.",
        plan.goal, steps, current_step, current, result, error
    );
    vec![Message::system(REFINE_SYSTEM_PROMPT), Message::user(user)]
}

fn reflection_messages(
    goal: &str,
    plan: &Plan,
    results: &[StepResult],
    context: &AgentContext,
) -> Vec<Message> {
    let mut results_text = String::new();
    for (i, result) in results.iter().enumerate() {
        let desc = plan
            .steps
            .get(i)
            .map(|s| s.description.as_str())
            .unwrap_or("Unknown step");
        results_text.push_str(&format!("Step {}: {}\n", i + 1, desc));
        results_text.push_str(&format!(
            "Status: {}\n",
            if result.success { "Success" } else { "Failed" }
        ));
        match &result.result {
            Some(v) => results_text.push_str(&format!("Result: {}\n", v)),
            None => results_text.push_str("Result: No result\n"),
        }
        if let Some(err) = &result.error {
            results_text.push_str(&format!("Error: {}\n", err));
        }
        results_text.push('\n');
    }

    let plan_json = serde_json::to_string_pretty(plan).unwrap_or_default();
    let mut user = format!(
        "Goal: {}\n\nPlan:\n{}\n\nResults:\n{}",
        goal, plan_json, results_text
    );
    let digest = context.memory_digest();
    if !digest.is_empty() {
        user.push_str(&format!("\nContext:\n{}\n", digest));
    }
    user.push_str("\nPlease reflect on this task execution, analyzing the approach, results, and what could be improved.");
    vec![Message::system(REFLECT_SYSTEM_PROMPT), Message::user(user)]
}
