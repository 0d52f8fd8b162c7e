/*
 * Agora - Multi-agent task marketplace
 * Copyright (C) 2025–2026 Agora contributors
 * SPDX-License-Identifier: AGPL-3.0-or-later
 */

#![allow(clippy::unwrap_used)]

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use agora_core::{
    ChainStatus, ChainStep, Clock, CoreError, RetryPolicy, Task, TaskChain, TaskFilter, TaskSpec,
    TaskStatus, TaskStore,
};
use common::{join, Harness};

fn linear() -> Vec<ChainStep> {
    vec![
        ChainStep::new("t1", TaskSpec::new("c", "ocr")),
        ChainStep::new("t2", TaskSpec::new("c", "ocr")).after(&["t1"]),
        ChainStep::new("t3", TaskSpec::new("c", "ocr")).after(&["t2"]),
    ]
}

#[tokio::test]
async fn test_linear_chain_completes_in_order() {
    let h = Harness::new();
    h.agent("a", &["ocr"]).await;
    let chain_id = h.chains.create_chain("c", linear()).await.unwrap();

    // chain members are not picked up by routing ticks
    assert_eq!(h.route().await, 0);

    let chain = h.chains.run_chain(&chain_id).await.unwrap();
    assert_eq!(chain.status, ChainStatus::Completed);
    assert!(chain.completed_at.is_some());
    assert_eq!(chain.step_results.len(), 3);

    let order: Vec<String> = h.transport.calls().into_iter().map(|(_, t)| t).collect();
    assert_eq!(order, chain.task_ids);
    for id in &chain.task_ids {
        let task = h.router.get_status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.chain_id.as_deref(), Some(chain_id.as_str()));
    }
    assert_eq!(chain.dependencies[&chain.task_ids[2]], vec![chain.task_ids[1].clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_step_waits_while_capable_agents_are_saturated() {
    let h = Harness::new();
    h.agent("a", &["ocr"]).await;
    let mut busy = Vec::new();
    for _ in 0..5 {
        let id = h.router.submit(TaskSpec::new("c", "ocr")).await.unwrap();
        h.router.assign(&id, "a").await.unwrap();
        busy.push(id);
    }

    let chain_id = h
        .chains
        .create_chain("c", vec![ChainStep::new("only", TaskSpec::new("c", "ocr"))])
        .await
        .unwrap();
    let step = h.chains.get_chain(&chain_id).await.unwrap().task_ids[0].clone();
    let chains = Arc::clone(&h.chains);
    let run_id = chain_id.clone();
    let run = tokio::spawn(async move { chains.run_chain(&run_id).await });

    tokio::time::sleep(Duration::from_secs(30)).await;
    let waiting = h.router.get_status(&step).await.unwrap();
    assert_eq!(waiting.status, TaskStatus::Pending);
    assert_eq!(waiting.retry_count, 0);
    assert!(waiting.error.is_none());
    assert!(!run.is_finished());

    // one slot frees up and the step goes through
    assert!(h.router.cancel(&busy[0], "ops", "make room").await.unwrap());
    let chain = run.await.unwrap().unwrap();
    assert_eq!(chain.status, ChainStatus::Completed);
    assert_eq!(
        h.router.get_status(&step).await.unwrap().status,
        TaskStatus::Completed
    );
    assert!(h.transport.delivered(&step));
}

#[tokio::test]
async fn test_step_without_capable_agent_fails_chain() {
    let h = Harness::new();
    h.agent("a", &["translate"]).await;
    let chain_id = h
        .chains
        .create_chain("c", vec![ChainStep::new("only", TaskSpec::new("c", "ocr"))])
        .await
        .unwrap();
    let chain = h.chains.run_chain(&chain_id).await.unwrap();
    assert_eq!(chain.status, ChainStatus::Failed);
    let step = h.router.get_status(&chain.task_ids[0]).await.unwrap();
    assert_eq!(step.status, TaskStatus::Failed);
    assert_eq!(
        step.error.as_deref(),
        Some("no eligible agent for capability ocr")
    );
}

#[tokio::test]
async fn test_failed_step_fails_chain_and_skips_successors() {
    let h = Harness::new();
    h.agent("a", &["ocr"]).await;
    h.agent("f", &["translate"]).await;
    h.transport.always_fail("f", "invalid input: unsupported language");

    let steps = vec![
        ChainStep::new("t1", TaskSpec::new("c", "ocr")),
        ChainStep::new(
            "t2",
            TaskSpec::new("c", "translate").with_retries(3, RetryPolicy::Fixed),
        )
        .after(&["t1"]),
        ChainStep::new("t3", TaskSpec::new("c", "ocr")).after(&["t2"]),
    ];
    let chain_id = h.chains.create_chain("c", steps).await.unwrap();
    let chain = h.chains.run_chain(&chain_id).await.unwrap();

    assert_eq!(chain.status, ChainStatus::Failed);
    let (t1, t2, t3) = (&chain.task_ids[0], &chain.task_ids[1], &chain.task_ids[2]);
    assert!(chain.error.as_deref().unwrap().contains(t2.as_str()));
    assert_eq!(h.router.get_status(t1).await.unwrap().status, TaskStatus::Completed);
    assert_eq!(h.router.get_status(t2).await.unwrap().status, TaskStatus::Failed);

    let skipped = h.router.get_status(t3).await.unwrap();
    assert_eq!(skipped.status, TaskStatus::Cancelled);
    assert_eq!(skipped.cancelled_by.as_deref(), Some("chain-engine"));
    assert!(!h.transport.delivered(t3));
}

#[tokio::test]
async fn test_diamond_runs_branches_in_one_round() {
    let h = Harness::new();
    h.agent("a", &["ocr"]).await;
    let steps = vec![
        ChainStep::new("root", TaskSpec::new("c", "ocr")),
        ChainStep::new("left", TaskSpec::new("c", "ocr")).after(&["root"]),
        ChainStep::new("right", TaskSpec::new("c", "ocr")).after(&["root"]),
        ChainStep::new("join", TaskSpec::new("c", "ocr")).after(&["left", "right"]),
    ];
    let chain_id = h.chains.create_chain("c", steps).await.unwrap();
    let chain = h.chains.run_chain(&chain_id).await.unwrap();
    assert_eq!(chain.status, ChainStatus::Completed);

    let order: Vec<String> = h.transport.calls().into_iter().map(|(_, t)| t).collect();
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], chain.task_ids[0]);
    assert_eq!(order[3], chain.task_ids[3]);
}

#[tokio::test]
async fn test_invalid_graph_creates_nothing() {
    let h = Harness::new();
    let cycle = vec![
        ChainStep::new("a", TaskSpec::new("c", "ocr")).after(&["b"]),
        ChainStep::new("b", TaskSpec::new("c", "ocr")).after(&["a"]),
    ];
    assert!(matches!(
        h.chains.create_chain("c", cycle).await,
        Err(CoreError::Validation(_))
    ));
    assert!(matches!(
        h.chains.create_chain("c", Vec::new()).await,
        Err(CoreError::Validation(_))
    ));
    assert!(h.store.list_tasks(&TaskFilter::default()).await.unwrap().is_empty());
    assert!(h.chains.list_chains(None).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_deadlock_is_reported_distinctly() {
    let h = Harness::new();
    h.agent("a", &["ocr"]).await;
    let now = h.clock.now();

    // a cycle written straight to the store, bypassing validation
    let mut members = Vec::new();
    for (id, dep) in [("x", "y"), ("y", "x")] {
        let mut task = Task::from_spec(
            id.into(),
            &TaskSpec::new("c", "ocr").depending_on(&[dep]),
            now,
            60,
            0,
            RetryPolicy::Fixed,
        );
        task.chain_id = Some("loop".into());
        h.store.insert_task(&task).await.unwrap();
        members.push(task);
    }
    let chain = TaskChain {
        chain_id: "loop".into(),
        client_id: "c".into(),
        task_ids: vec!["x".into(), "y".into()],
        dependencies: BTreeMap::from([
            ("x".to_string(), vec!["y".to_string()]),
            ("y".to_string(), vec!["x".to_string()]),
        ]),
        status: ChainStatus::Pending,
        step_results: BTreeMap::new(),
        error: None,
        created_at: now,
        completed_at: None,
        version: 0,
    };
    h.store.insert_chain(&chain).await.unwrap();

    assert!(matches!(
        h.chains.run_chain("loop").await,
        Err(CoreError::ChainDeadlock(id)) if id == "loop"
    ));
    let chain = h.chains.get_chain("loop").await.unwrap();
    assert_eq!(chain.status, ChainStatus::Deadlocked);
    assert!(chain.error.is_some());
    for task in members {
        let stored = h.router.get_status(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
    }
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn test_chain_worker_runs_each_pending_chain_once() {
    let h = Harness::new();
    h.agent("a", &["ocr"]).await;
    let chain_id = h.chains.create_chain("c", linear()).await.unwrap();

    assert_eq!(join(h.chains.run_pending_chains().await.unwrap()).await, 1);
    assert_eq!(
        h.chains.get_chain(&chain_id).await.unwrap().status,
        ChainStatus::Completed
    );
    assert_eq!(join(h.chains.run_pending_chains().await.unwrap()).await, 0);
    assert!(matches!(
        h.chains.run_chain(&chain_id).await,
        Err(CoreError::Validation(_))
    ));
    assert_eq!(h.transport.calls().len(), 3);
}
