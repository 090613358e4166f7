//! End-to-end tests for non-distribution publishing jobs.
//!
//! These tests run whole jobs against the in-memory repository and check
//! the job status, the per-document ledger and the output tree.


use std::collections::HashSet;

use chrono::{TimeZone, Utc};
use docpub::error::PublishError;
use docpub::repository::{FilterOutput, StoredDocument, StoredVersion};
use docpub::scheduler::{JobRecord, JobStatus, RequestedDocument};
use test_harness::{
    created, doc, spec, standard_system, subset, TestEnv, SUMMARY_QUERY, SYSTEM,
};

/// Add a `Checked` subset whose filter chain ends with `check`, plus the
/// `check` filter itself: warns for `warn_ids`, rejects `reject_ids`.
fn install_checked_subset(env: &TestEnv, warn_ids: &[i64], reject_ids: &[i64]) {
    let mut system = standard_system();
    system.subsets.push(subset(
        "Checked",
        vec![spec(
            "summaries",
            &["Summary"],
            Some(SUMMARY_QUERY),
            &["identity", "check"],
        )],
    ));
    env.repo.add_system(system);

    let warn: HashSet<i64> = warn_ids.iter().copied().collect();
    let reject: HashSet<i64> = reject_ids.iter().copied().collect();
    env.repo.register_filter("check", move |call| {
        if reject.contains(&call.doc_id) {
            return Err(format!("document {} failed the check", call.doc_id));
        }
        let warnings = if warn.contains(&call.doc_id) {
            vec![format!("document {} looks odd", call.doc_id)]
        } else {
            Vec::new()
        };
        Ok(FilterOutput {
            content: call.content.to_string(),
            warnings,
        })
    });
}

fn xml_files(dir: &std::path::Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".xml"))
        .count()
}

#[tokio::test]
async fn test_warnings_only_documents_are_published() {
    let env = TestEnv::with_summaries(1..=10).await;
    install_checked_subset(&env, &[3, 7], &[]);

    let summary = env
        .run("Checked", "out", &[("PublishIfWarnings", "Yes")], &[])
        .await;

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.selected, 10);
    assert_eq!(summary.published, 10);
    assert_eq!(summary.errors, 0);
    assert_eq!(summary.warnings, 2);
    assert_eq!(xml_files(&env.output_dir("out")), 10);

    let ledger = env.store.ledger(summary.job_id).await.unwrap();
    let warned = ledger.iter().find(|e| e.doc_id == 3).unwrap();
    assert!(warned.succeeded());
    assert!(warned.messages.as_deref().unwrap().contains("looks odd"));
}

#[tokio::test]
async fn test_warnings_reject_when_policy_says_no() {
    let env = TestEnv::with_summaries(1..=10).await;
    install_checked_subset(&env, &[3, 7], &[]);

    let summary = env
        .run("Checked", "out", &[("PublishIfWarnings", "No")], &[])
        .await;

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.published, 8);
    assert_eq!(summary.errors, 2);
    let out = env.output_dir("out");
    assert!(!out.join("3.xml").exists());
    assert!(!out.join("7.xml").exists());
    assert!(out.join("4.xml").exists());
}

#[tokio::test]
async fn test_error_threshold_allows_exactly_n_errors() {
    let env = TestEnv::with_summaries(1..=10).await;
    install_checked_subset(&env, &[], &[2, 5]);

    let summary = env
        .run("Checked", "out", &[("AbortOnError", "2")], &[])
        .await;

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.errors, 2);
    assert_eq!(summary.published, 8);
    assert!(env.output_dir("out").exists());
}

#[tokio::test]
async fn test_error_threshold_aborts_on_n_plus_one() {
    let env = TestEnv::with_summaries(1..=10).await;
    install_checked_subset(&env, &[], &[2, 5, 8]);

    let summary = env
        .run("Checked", "out", &[("AbortOnError", "2")], &[])
        .await;

    assert_eq!(summary.status, JobStatus::Failure);
    assert!(summary.message.contains("error threshold"));
    assert!(!env.output_dir("out").exists());
    assert!(env.output_dir("out.FAILURE").exists());

    let record = env.store.job(summary.job_id).await.unwrap();
    assert_eq!(record.status, JobStatus::Failure);
    assert!(record.completed.is_some());
}

#[tokio::test]
async fn test_first_error_aborts_before_any_output() {
    let env = TestEnv::with_summaries(1..=2).await;
    env.repo
        .add_query(SUMMARY_QUERY, test_harness::query_rows([1, 2, 99]));

    let summary = env
        .run("Export", "out", &[("AbortOnError", "0")], &[])
        .await;

    assert_eq!(summary.status, JobStatus::Failure);
    assert_eq!(summary.published, 0);
    assert!(!env.output_dir("out").exists());
    assert_eq!(xml_files(&env.output_dir("out.FAILURE")), 0);
}

#[tokio::test]
async fn test_per_doctype_budget_aborts_job() {
    let env = TestEnv::with_summaries(1..=4).await;
    install_checked_subset(&env, &[], &[1]);

    let summary = env
        .run("Checked", "out", &[("MaxSummaryErrors", "0")], &[])
        .await;

    assert_eq!(summary.status, JobStatus::Failure);
    assert!(summary.message.contains("MaxSummaryErrors"));
}

#[tokio::test]
async fn test_selection_failures_are_recorded_and_counted() {
    let env = TestEnv::with_summaries(1..=3).await;
    env.repo.add_document(
        StoredDocument::new(20, "Summary", "Retired")
            .with_version(StoredVersion::new(1, created(), "<Summary/>")),
    );
    env.repo.set_active(20, false);
    env.repo.add_document(
        StoredDocument::new(21, "Summary", "Draft")
            .with_version(StoredVersion::new(1, created(), "<Summary/>").unpublishable()),
    );
    env.repo.add_document(
        StoredDocument::new(22, "Glossary", "Term")
            .with_version(StoredVersion::new(1, created(), "<Term/>")),
    );

    let summary = env
        .run("Hotfix", "out", &[], &[doc(1), doc(20), doc(21), doc(22), doc(404)])
        .await;

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.selected, 5);
    assert_eq!(summary.published, 1);
    assert_eq!(summary.errors, 4);

    let ledger = env.store.ledger(summary.job_id).await.unwrap();
    let failed: HashSet<i64> = ledger
        .iter()
        .filter(|e| e.failure)
        .map(|e| e.doc_id)
        .collect();
    assert_eq!(failed, [20, 21, 22, 404].into_iter().collect());
    let retired = ledger.iter().find(|e| e.doc_id == 20).unwrap();
    assert!(retired.messages.as_deref().unwrap().contains("not active"));
}

#[tokio::test]
async fn test_explicit_and_query_documents_are_deduplicated() {
    let env = TestEnv::with_summaries(1..=3).await;

    let summary = env
        .run(
            "Export",
            "out",
            &[],
            &[
                doc(2),
                RequestedDocument {
                    doc_id: 2,
                    version: Some(1),
                },
            ],
        )
        .await;

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.selected, 3);
    let ledger = env.store.ledger(summary.job_id).await.unwrap();
    assert_eq!(ledger.len(), 3);
}

#[tokio::test]
async fn test_all_documents_failing_fails_the_job() {
    let env = TestEnv::with_summaries(1..=3).await;
    install_checked_subset(&env, &[], &[1, 2, 3]);

    let summary = env.run("Checked", "out", &[], &[]).await;

    assert_eq!(summary.status, JobStatus::Failure);
    assert_eq!(summary.message, "All documents failed");
}

#[tokio::test]
async fn test_empty_selection_succeeds() {
    let env = TestEnv::with_summaries(std::iter::empty::<i64>()).await;

    let summary = env.run("Export", "out", &[], &[]).await;

    assert_eq!(summary.status, JobStatus::Success);
    assert_eq!(summary.selected, 0);
    assert_eq!(summary.published, 0);
    assert!(env.output_dir("out").exists());
}

#[tokio::test]
async fn test_report_only_leaves_output_in_failed_tree() {
    let env = TestEnv::with_summaries(1..=3).await;

    let summary = env.run("Export", "out", &[("ReportOnly", "Yes")], &[]).await;

    assert_eq!(summary.status, JobStatus::Failure);
    assert_eq!(summary.published, 3);
    assert!(!env.output_dir("out").exists());
    assert_eq!(xml_files(&env.output_dir("out.FAILURE")), 3);
}

#[tokio::test]
async fn test_unknown_subset_fails_at_load() {
    let env = TestEnv::with_summaries(1..=3).await;

    let summary = env.run("Nonexistent", "out", &[], &[]).await;

    assert_eq!(summary.status, JobStatus::Failure);
    assert!(env.messages(summary.job_id).await.contains("Nonexistent"));
    assert!(!env.output_dir("out").exists());
}

#[tokio::test]
async fn test_finished_job_is_not_rerun() {
    let env = TestEnv::with_summaries(1..=2).await;
    let summary = env.run("Export", "out", &[], &[]).await;
    assert_eq!(summary.status, JobStatus::Success);

    let err = env.publisher().run_job(summary.job_id).await.unwrap_err();
    assert!(matches!(err, PublishError::UnexpectedStatus(_)));
}

#[tokio::test]
async fn test_leftover_output_is_moved_aside() {
    let env = TestEnv::with_summaries(1..=2).await;
    let out = env.output_dir("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("stale.xml"), b"<old/>").unwrap();

    let summary = env.run("Export", "out", &[], &[]).await;

    assert_eq!(summary.status, JobStatus::Success);
    assert!(!out.join("stale.xml").exists());
    assert!(out.join("1.xml").exists());
    let aside = std::fs::read_dir(env.dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("out-"))
        .count();
    assert_eq!(aside, 1);
}

#[tokio::test]
async fn test_media_documents_bypass_filters_and_fill_manifest() {
    let env = TestEnv::new().await;
    let mut system = standard_system();
    system.subsets.push(subset(
        "Media",
        vec![spec("media", &["Media"], None, &["reject"])],
    ));
    env.repo.add_system(system);
    env.repo.add_document(
        StoredDocument::new(50, "Media", "Heart, anterior view").with_version(
            StoredVersion::new(1, created(), "").with_blob(b"\xff\xd8\xffjpeg", "jpg"),
        ),
    );

    let summary = env.run("Media", "out", &[], &[doc(50)]).await;

    assert_eq!(summary.status, JobStatus::Success);
    let out = env.output_dir("out");
    assert_eq!(std::fs::read(out.join("50.jpg")).unwrap(), b"\xff\xd8\xffjpeg");
    let manifest = std::fs::read_to_string(out.join("media_catalog.txt")).unwrap();
    assert_eq!(manifest, "50.jpg,2024-01-01,\"Heart, anterior view\"\n");
}

#[tokio::test]
async fn test_subdirectory_and_first_publication_date() {
    let env = TestEnv::new().await;
    let mut dated = spec("dated", &["Summary"], Some(SUMMARY_QUERY), &["substitute"]);
    dated.subdirectory = Some("summaries".to_string());
    let mut system = standard_system();
    system.subsets.push(subset("Dated", vec![dated]));
    env.repo.add_system(system);
    env.repo.add_document(
        StoredDocument::new(1, "Summary", "Dated").with_version(StoredVersion::new(
            1,
            created(),
            "<Summary first='{{DateFirstPub}}'/>",
        )),
    );
    env.repo.add_query(SUMMARY_QUERY, test_harness::query_rows([1]));

    // First publication at a known date.
    let started = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    let first = env
        .store
        .create_job(
            &JobRecord::new(0, SYSTEM, "Dated", env.output_dir("first")).with_started(started),
        )
        .await
        .unwrap();
    let summary = env.publisher().run_job(first).await.unwrap();
    assert_eq!(summary.status, JobStatus::Success);
    let text =
        std::fs::read_to_string(env.output_dir("first").join("summaries").join("1.xml")).unwrap();
    assert_eq!(text, "<Summary first='2024-06-01'/>");

    // A later job still carries the first date.
    let summary = env.run("Dated", "second", &[], &[]).await;
    assert_eq!(summary.status, JobStatus::Success);
    let text =
        std::fs::read_to_string(env.output_dir("second").join("summaries").join("1.xml")).unwrap();
    assert_eq!(text, "<Summary first='2024-06-01'/>");
}

#[tokio::test]
async fn test_job_log_records_progress() {
    let env = TestEnv::with_summaries(1..=3).await;

    let summary = env.run("Export", "out", &[], &[]).await;

    let messages = env.messages(summary.job_id).await;
    assert!(messages.contains("Job started"));
    assert!(messages.contains("Selected 3 documents"));
    assert!(messages.contains("Job completed: 3 documents published, 0 removed, 0 errors, 0 warnings"));
    assert!(summary
        .message
        .starts_with("Job completed: 3 documents published"));
}
