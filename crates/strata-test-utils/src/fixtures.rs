use chrono::Utc;
use serde_json::json;

use strata_core::types::{
    Routine, Swarm, SwarmCoordination, SwarmId, SwarmResources, SwarmState, VarMap,
};

/// start -> split -> (left | right) -> join -> end.
///
/// Both branch tasks are deterministic and write the key `result`, so a merge
/// of their outputs collides.
pub fn parallel_routine() -> Routine {
    Routine {
        id: "parallel-routine".into(),
        name: "Parallel fan-out".into(),
        graph_type: "native".into(),
        definition: json!({
            "nodes": [
                {"id": "start", "kind": "start"},
                {"id": "split", "kind": "parallel_gateway"},
                {"id": "left", "kind": "task", "strategy": "deterministic",
                 "outputs": ["result"], "config": {"result": "left"}},
                {"id": "right", "kind": "task", "strategy": "deterministic",
                 "outputs": ["result"], "config": {"result": "right"}},
                {"id": "join", "kind": "join"},
                {"id": "end", "kind": "end"}
            ],
            "edges": [
                {"from": "start", "to": "split"},
                {"from": "split", "to": "left"},
                {"from": "split", "to": "right"},
                {"from": "left", "to": "join"},
                {"from": "right", "to": "join"},
                {"from": "join", "to": "end"}
            ]
        }),
        default_strategy: Some("deterministic".into()),
    }
}

/// start -> decide -> approve (score > 0.5) | reject (default) -> end.
pub fn branching_routine() -> Routine {
    Routine {
        id: "branching-routine".into(),
        name: "Score gate".into(),
        graph_type: "native".into(),
        definition: json!({
            "nodes": [
                {"id": "start", "kind": "start"},
                {"id": "decide", "kind": "exclusive_gateway"},
                {"id": "approve", "kind": "task", "strategy": "deterministic",
                 "inputs": ["score"], "config": {"decision": "approved"}},
                {"id": "reject", "kind": "task", "strategy": "deterministic",
                 "inputs": ["score"], "config": {"decision": "rejected"}},
                {"id": "end", "kind": "end"}
            ],
            "edges": [
                {"from": "start", "to": "decide"},
                {"from": "decide", "to": "approve", "condition": "score > 0.5"},
                {"from": "decide", "to": "reject"},
                {"from": "approve", "to": "end"},
                {"from": "reject", "to": "end"}
            ]
        }),
        default_strategy: Some("deterministic".into()),
    }
}

/// start -> split -> (decide -> low | high) and (other) -> join -> end.
///
/// `decide` is an exclusive gateway inside a parallel branch: `high` runs
/// when `score >= 0.5`, `low` when `score < 0.5`.
pub fn conditional_parallel_routine() -> Routine {
    Routine {
        id: "conditional-parallel-routine".into(),
        name: "Scored fan-out".into(),
        graph_type: "native".into(),
        definition: json!({
            "nodes": [
                {"id": "start", "kind": "start"},
                {"id": "split", "kind": "parallel_gateway"},
                {"id": "decide", "kind": "exclusive_gateway"},
                {"id": "low", "kind": "task", "strategy": "deterministic",
                 "config": {"picked": "low"}},
                {"id": "high", "kind": "task", "strategy": "deterministic",
                 "config": {"picked": "high"}},
                {"id": "other", "kind": "task", "strategy": "deterministic",
                 "config": {"side": "other"}},
                {"id": "join", "kind": "join"},
                {"id": "end", "kind": "end"}
            ],
            "edges": [
                {"from": "start", "to": "split"},
                {"from": "split", "to": "decide"},
                {"from": "split", "to": "other"},
                {"from": "decide", "to": "low", "condition": "score < 0.5"},
                {"from": "decide", "to": "high", "condition": "score >= 0.5"},
                {"from": "low", "to": "join"},
                {"from": "high", "to": "join"},
                {"from": "other", "to": "join"},
                {"from": "join", "to": "end"}
            ]
        }),
        default_strategy: Some("deterministic".into()),
    }
}

/// `outer` forks `inner` and `z`; `inner` forks `x` and `y` with its own join.
pub fn nested_parallel_routine() -> Routine {
    Routine {
        id: "nested-parallel-routine".into(),
        name: "Nested fan-out".into(),
        graph_type: "native".into(),
        definition: json!({
            "nodes": [
                {"id": "start", "kind": "start"},
                {"id": "outer", "kind": "parallel_gateway"},
                {"id": "inner", "kind": "parallel_gateway"},
                {"id": "x", "kind": "task", "strategy": "deterministic", "config": {"x": 1}},
                {"id": "y", "kind": "task", "strategy": "deterministic", "config": {"y": 1}},
                {"id": "inner_join", "kind": "join"},
                {"id": "z", "kind": "task", "strategy": "deterministic", "config": {"z": 1}},
                {"id": "outer_join", "kind": "join"},
                {"id": "end", "kind": "end"}
            ],
            "edges": [
                {"from": "start", "to": "outer"},
                {"from": "outer", "to": "inner"},
                {"from": "outer", "to": "z"},
                {"from": "inner", "to": "x"},
                {"from": "inner", "to": "y"},
                {"from": "x", "to": "inner_join"},
                {"from": "y", "to": "inner_join"},
                {"from": "inner_join", "to": "outer_join"},
                {"from": "z", "to": "outer_join"},
                {"from": "outer_join", "to": "end"}
            ]
        }),
        default_strategy: Some("deterministic".into()),
    }
}

/// start -> (a | b) -> c -> end, with `c` reached from both `a` and `b`.
pub fn reconverging_routine() -> Routine {
    Routine {
        id: "reconverging-routine".into(),
        name: "Diamond".into(),
        graph_type: "native".into(),
        definition: json!({
            "nodes": [
                {"id": "start", "kind": "start"},
                {"id": "a", "kind": "task", "strategy": "deterministic", "config": {"a": 1}},
                {"id": "b", "kind": "task", "strategy": "deterministic", "config": {"b": 1}},
                {"id": "c", "kind": "task", "strategy": "deterministic", "config": {"c": 1}},
                {"id": "end", "kind": "end"}
            ],
            "edges": [
                {"from": "start", "to": "a"},
                {"from": "start", "to": "b"},
                {"from": "a", "to": "c"},
                {"from": "b", "to": "c"},
                {"from": "c", "to": "end"}
            ]
        }),
        default_strategy: Some("deterministic".into()),
    }
}

/// Two-step sequential routine using the built-in tools.
pub fn sequential_routine() -> Routine {
    Routine {
        id: "sequential-routine".into(),
        name: "Fetch and render".into(),
        graph_type: "sequential".into(),
        definition: json!({
            "steps": [
                {"id": "fetch", "strategy": "deterministic", "tool": "json_query",
                 "inputs": ["payload"], "config": {"json": {"user": {"name": "Ada"}}, "path": "user.name"}},
                {"id": "render", "strategy": "deterministic", "tool": "template",
                 "inputs": ["result"], "config": {"template": "Hello {{result}}"}}
            ]
        }),
        default_strategy: Some("deterministic".into()),
    }
}

/// A routine in a graph format no navigator understands.
pub fn opaque_routine() -> Routine {
    Routine {
        id: "opaque-routine".into(),
        name: "Opaque".into(),
        graph_type: "bpmn-xml".into(),
        definition: json!("<definitions/>"),
        default_strategy: Some("deterministic".into()),
    }
}

/// A live swarm with the given budget.
pub fn swarm(user_id: &str, max_credits: u64, credits_used: u64) -> Swarm {
    Swarm {
        id: SwarmId::new(),
        user_id: user_id.into(),
        name: "fixture swarm".into(),
        goal: "Summarize the quarterly reports".into(),
        resources: SwarmResources {
            max_credits,
            credits_used,
            ..Default::default()
        },
        blackboard: VarMap::from([("phase".to_string(), json!("research"))]),
        shared_knowledge: vec![json!({"fact": "reports are in EUR"})],
        coordination: SwarmCoordination {
            shared_learning: true,
            collaborative_proposals: false,
        },
        child_runs: Vec::new(),
        state: SwarmState::Active,
        created_at: Utc::now(),
    }
}
