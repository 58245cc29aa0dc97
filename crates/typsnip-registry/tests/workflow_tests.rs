//! Create/update workflow tests against the in-memory store

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use typsnip::{BudgetStage, PackageUsage, RenderResult, RenderSettings, Renderer, SnippetError, User};
use typsnip_registry::*;

#[derive(Clone, Copy)]
enum Outcome {
    Ok(u64),
    CompileError(u64),
    Unavailable,
}

/// Render service stand-in answering per version, recording each call
#[derive(Default)]
struct FakeRenderer {
    outcomes: Mutex<HashMap<String, Outcome>>,
    calls: Mutex<Vec<String>>,
}

impl FakeRenderer {
    fn answer(&self, version: &str, outcome: Outcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(version.to_string(), outcome);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn forget_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, content: &str, version: &str, timeout_ms: u64) -> typsnip::Result<RenderResult> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(version.to_string());
            calls.len()
        };
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .get(version)
            .copied()
            .unwrap_or(Outcome::Ok(500));

        match outcome {
            Outcome::Ok(time_used) => Ok(RenderResult {
                svg: format!("<svg data-call=\"{}\">{} @ {}</svg>", call, content.len(), version),
                version: version.to_string(),
                time_used,
                success: true,
                error: None,
            }),
            Outcome::CompileError(time_used) => Ok(RenderResult::failure(
                version,
                time_used.min(timeout_ms),
                "line:1:2: unknown variable: foo",
            )),
            Outcome::Unavailable => Err(SnippetError::ServiceUnavailable(
                "connection refused".into(),
            )),
        }
    }
}

struct Harness {
    service: SnippetService,
    store: Arc<MemorySnippetStore>,
    blobs: Arc<MemoryStorage>,
    renderer: Arc<FakeRenderer>,
}

fn harness() -> Harness {
    let store = Arc::new(MemorySnippetStore::new());
    let blobs = Arc::new(MemoryStorage::new());
    let renderer = Arc::new(FakeRenderer::default());
    let service = SnippetService::new(
        store.clone(),
        store.clone(),
        blobs.clone(),
        renderer.clone(),
        RenderSettings::default(),
    );
    Harness {
        service,
        store,
        blobs,
        renderer,
    }
}

impl Harness {
    fn user_with_budget(&self, name: &str, balance: i64) -> User {
        let mut user = self.store.create_user(name).unwrap();
        user.computation_time = balance;
        user.computation_time_reset = OffsetDateTime::now_utc() + Duration::hours(6);
        self.store.put_user(user.clone()).unwrap();
        user
    }

    fn stored_balance(&self, user: &User) -> i64 {
        self.store.user(user.id).unwrap().unwrap().computation_time
    }

    async fn snippet_count(&self) -> u64 {
        self.store
            .list_snippets(&SnippetQuery::new().with_trashed())
            .await
            .unwrap()
            .total
    }
}

fn request(title: &str, versions: &[&str]) -> CreateSnippet {
    CreateSnippet {
        title: title.into(),
        description: None,
        content: "#set page(width: auto)\n#table(columns: 3)[a][b][c]".into(),
        is_public: true,
        author: Some("alice".into()),
        copy_recommendation: None,
        tags: vec![],
        packages: vec![],
        versions: versions.iter().map(|v| v.to_string()).collect(),
    }
}

fn versions(list: &[&str]) -> Option<Vec<String>> {
    Some(list.iter().map(|v| v.to_string()).collect())
}

fn version_rows(snippet: &typsnip::Snippet) -> Vec<(String, bool)> {
    let mut rows: Vec<(String, bool)> = snippet
        .versions
        .iter()
        .map(|v| (v.version.clone(), v.success))
        .collect();
    rows.sort();
    rows
}

#[tokio::test]
async fn test_budget_below_timeout_blocks_before_rendering() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 4_000);

    let err = h
        .service
        .create(&mut user, request("Budget test", &["0.12.0", "0.13.1"]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SnippetError::InsufficientBudget {
            stage: BudgetStage::BeforeStart
        }
    ));
    assert!(h.renderer.calls().is_empty());
    assert_eq!(h.snippet_count().await, 0);
    assert_eq!(h.stored_balance(&user), 4_000);
}

#[tokio::test]
async fn test_create_keeps_highest_successful_render() {
    let h = harness();
    h.renderer.answer("0.13.1", Outcome::CompileError(800));
    h.renderer.answer("0.13.0", Outcome::Ok(1_200));
    let mut user = h.user_with_budget("alice", 60_000);

    let snippet = h
        .service
        .create(&mut user, request("Three columns", &["0.13.0", "0.13.1"]))
        .await
        .unwrap();

    assert_eq!(h.renderer.calls(), vec!["0.13.1", "0.13.0"]);
    let image = snippet.image.clone().unwrap();
    assert!(image.starts_with(&format!("{}-", snippet.public_id)));
    let svg = h.service.artifacts().get(&image).await.unwrap();
    assert!(String::from_utf8(svg).unwrap().contains("@ 0.13.0"));
    assert_eq!(
        version_rows(&snippet),
        vec![("0.13.0".to_string(), true), ("0.13.1".to_string(), false)]
    );
    assert_eq!(h.stored_balance(&user), 60_000 - 2_000);
    assert_eq!(user.computation_time, 58_000);
}

#[tokio::test]
async fn test_create_defaults_to_latest_version() {
    let h = harness();
    let mut user = h.store.create_user("alice").unwrap();

    let snippet = h
        .service
        .create(&mut user, request("Defaults", &[]))
        .await
        .unwrap();

    assert_eq!(h.renderer.calls(), vec!["0.14.0"]);
    assert_eq!(version_rows(&snippet), vec![("0.14.0".to_string(), true)]);
    // first operation of the day refills the budget
    assert_eq!(h.stored_balance(&user), 60_000 - 500);
}

#[tokio::test]
async fn test_unknown_version_is_rejected() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 60_000);

    let err = h
        .service
        .create(&mut user, request("Unknown", &["0.9.0"]))
        .await
        .unwrap_err();

    assert!(matches!(err, SnippetError::Validation(_)));
    assert!(h.renderer.calls().is_empty());
}

#[tokio::test]
async fn test_all_versions_failing_reports_each() {
    let h = harness();
    h.renderer.answer("0.13.1", Outcome::CompileError(100));
    h.renderer.answer("0.12.0", Outcome::CompileError(150));
    let mut user = h.user_with_budget("alice", 60_000);

    let err = h
        .service
        .create(&mut user, request("Broken", &["0.12.0", "0.13.1"]))
        .await
        .unwrap_err();

    let text = err.to_string();
    assert!(text.contains("v0.13.1: line:1:2: unknown variable: foo"));
    assert!(text.contains("v0.12.0: line:1:2: unknown variable: foo"));
    assert_eq!(h.snippet_count().await, 0);
    assert!(h.blobs.is_empty());
    assert_eq!(h.stored_balance(&user), 60_000 - 250);
}

#[tokio::test]
async fn test_duplicate_title_is_checked_before_rendering() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 60_000);
    h.service
        .create(&mut user, request("Fancy Tables", &["0.13.1"]))
        .await
        .unwrap();
    h.renderer.forget_calls();

    let err = h
        .service
        .create(&mut user, request("fancy tables", &["0.13.1"]))
        .await
        .unwrap_err();

    assert!(matches!(err, SnippetError::DuplicateTitle(_)));
    assert!(h.renderer.calls().is_empty());
}

#[tokio::test]
async fn test_unavailable_service_rolls_back_but_keeps_charges() {
    let h = harness();
    let tag = h.store.insert_tag("tables").unwrap();
    h.renderer.answer("0.14.0", Outcome::Ok(3_000));
    h.renderer.answer("0.13.1", Outcome::Unavailable);
    let mut user = h.user_with_budget("alice", 60_000);

    let mut create = request("Outage", &["0.13.1", "0.14.0"]);
    create.tags = vec![tag.public_id];
    let err = h.service.create(&mut user, create).await.unwrap_err();

    assert!(matches!(err, SnippetError::ServiceUnavailable(_)));
    assert_eq!(h.snippet_count().await, 0);
    assert_eq!(h.stored_balance(&user), 57_000);
}

#[tokio::test]
async fn test_budget_running_out_mid_batch_keeps_partial_charge() {
    let h = harness();
    h.renderer.answer("0.14.0", Outcome::Ok(4_000));
    let mut user = h.user_with_budget("alice", 8_000);

    let err = h
        .service
        .create(&mut user, request("Partial", &["0.13.1", "0.14.0"]))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SnippetError::InsufficientBudget {
            stage: BudgetStage::AfterPartial { rendered: 1 }
        }
    ));
    assert_eq!(h.renderer.calls(), vec!["0.14.0"]);
    assert_eq!(h.snippet_count().await, 0);
    assert_eq!(h.stored_balance(&user), 4_000);
}

#[tokio::test]
async fn test_unchanged_update_renders_nothing() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 60_000);
    let created = h
        .service
        .create(&mut user, request("Stable", &["0.13.0", "0.13.1"]))
        .await
        .unwrap();
    h.renderer.forget_calls();
    let balance = h.stored_balance(&user);

    let update = UpdateSnippet {
        content: Some(created.content.clone()),
        versions: versions(&["0.13.1", "0.13.0"]),
        ..UpdateSnippet::default()
    };
    let updated = h
        .service
        .update(&mut user, &created.public_id, update)
        .await
        .unwrap();

    assert!(h.renderer.calls().is_empty());
    assert_eq!(updated.image, created.image);
    assert_eq!(h.stored_balance(&user), balance);
}

#[tokio::test]
async fn test_description_edit_leaves_image_and_versions() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 60_000);
    let created = h
        .service
        .create(&mut user, request("Described", &["0.13.0", "0.13.1"]))
        .await
        .unwrap();
    h.renderer.forget_calls();

    let update = UpdateSnippet {
        description: Some("Three columns, no frills".into()),
        ..UpdateSnippet::default()
    };
    let updated = h
        .service
        .update(&mut user, &created.public_id, update)
        .await
        .unwrap();

    assert!(h.renderer.calls().is_empty());
    assert_eq!(updated.description.as_deref(), Some("Three columns, no frills"));
    assert_eq!(updated.image, created.image);
    assert_eq!(updated.versions, created.versions);
}

#[tokio::test]
async fn test_content_change_rerenders_kept_versions() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 60_000);
    let created = h
        .service
        .create(&mut user, request("Edited", &["0.13.1"]))
        .await
        .unwrap();
    h.renderer.forget_calls();

    let update = UpdateSnippet {
        content: Some("#set page(width: auto)\n#grid(columns: 2)[x][y]".into()),
        versions: versions(&["0.13.1"]),
        ..UpdateSnippet::default()
    };
    let updated = h
        .service
        .update(&mut user, &created.public_id, update)
        .await
        .unwrap();

    assert_eq!(h.renderer.calls(), vec!["0.13.1"]);
    assert_ne!(updated.image, created.image);
    assert_eq!(version_rows(&updated), vec![("0.13.1".to_string(), true)]);
    // superseded artifacts are kept
    assert_eq!(h.blobs.len(), 2);
}

#[tokio::test]
async fn test_content_only_update_renders_latest_version() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 60_000);
    let created = h
        .service
        .create(&mut user, request("Older engine", &["0.13.1"]))
        .await
        .unwrap();
    h.renderer.forget_calls();

    let update = UpdateSnippet {
        content: Some("#set page(width: auto)\n#grid(columns: 3)[x][y][z]".into()),
        ..UpdateSnippet::default()
    };
    let updated = h
        .service
        .update(&mut user, &created.public_id, update)
        .await
        .unwrap();

    assert_eq!(h.renderer.calls(), vec!["0.14.0"]);
    assert_eq!(version_rows(&updated), vec![("0.14.0".to_string(), true)]);
    assert_ne!(updated.image, created.image);
}

#[tokio::test]
async fn test_removed_version_is_deleted_not_rendered() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 60_000);
    let created = h
        .service
        .create(&mut user, request("Trimmed", &["0.13.0", "0.13.1"]))
        .await
        .unwrap();
    h.renderer.forget_calls();

    let update = UpdateSnippet {
        versions: versions(&["0.13.1"]),
        ..UpdateSnippet::default()
    };
    let updated = h
        .service
        .update(&mut user, &created.public_id, update)
        .await
        .unwrap();

    assert!(h.renderer.calls().is_empty());
    assert_eq!(version_rows(&updated), vec![("0.13.1".to_string(), true)]);
    assert_eq!(updated.image, created.image);
}

#[tokio::test]
async fn test_image_is_not_downgraded_when_top_version_fails() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 60_000);
    let created = h
        .service
        .create(&mut user, request("Downgrade", &["0.13.0", "0.13.1"]))
        .await
        .unwrap();
    h.renderer.forget_calls();
    h.renderer.answer("0.13.1", Outcome::CompileError(300));

    let update = UpdateSnippet {
        content: Some("#set page(width: auto)\n#foo[only in old versions]".into()),
        versions: versions(&["0.13.0", "0.13.1"]),
        ..UpdateSnippet::default()
    };
    let updated = h
        .service
        .update(&mut user, &created.public_id, update)
        .await
        .unwrap();

    assert_eq!(h.renderer.calls(), vec!["0.13.1", "0.13.0"]);
    assert_eq!(updated.image, created.image);
    assert_eq!(
        version_rows(&updated),
        vec![("0.13.0".to_string(), true), ("0.13.1".to_string(), false)]
    );
}

#[tokio::test]
async fn test_new_highest_version_replaces_image() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 60_000);
    let created = h
        .service
        .create(&mut user, request("Upgrade", &["0.13.0"]))
        .await
        .unwrap();
    h.renderer.forget_calls();

    let update = UpdateSnippet {
        versions: versions(&["0.13.0", "0.14.0"]),
        ..UpdateSnippet::default()
    };
    let updated = h
        .service
        .update(&mut user, &created.public_id, update)
        .await
        .unwrap();

    assert_eq!(h.renderer.calls(), vec!["0.14.0"]);
    assert_ne!(updated.image, created.image);
    assert_eq!(
        version_rows(&updated),
        vec![("0.13.0".to_string(), true), ("0.14.0".to_string(), true)]
    );
}

#[tokio::test]
async fn test_failed_update_rolls_back_metadata() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 60_000);
    let created = h
        .service
        .create(&mut user, request("Rollback", &["0.13.1"]))
        .await
        .unwrap();
    h.renderer.answer("0.13.1", Outcome::Unavailable);

    let update = UpdateSnippet {
        title: Some("Rollback renamed".into()),
        content: Some("#set page(width: auto)\n#lorem(30)".into()),
        versions: versions(&["0.13.1"]),
        ..UpdateSnippet::default()
    };
    let err = h
        .service
        .update(&mut user, &created.public_id, update)
        .await
        .unwrap_err();

    assert!(matches!(err, SnippetError::ServiceUnavailable(_)));
    let stored = h.service.get(&created.public_id, Some(&user)).await.unwrap();
    assert_eq!(stored.title, "Rollback");
    assert_eq!(stored.content, created.content);
}

#[tokio::test]
async fn test_only_owner_or_manager_may_edit_and_delete() {
    let h = harness();
    let mut alice = h.user_with_budget("alice", 60_000);
    let mut bob = h.user_with_budget("bob", 60_000);
    let created = h
        .service
        .create(&mut alice, request("Owned", &["0.13.1"]))
        .await
        .unwrap();

    let rename = UpdateSnippet {
        title: Some("Stolen".into()),
        ..UpdateSnippet::default()
    };
    let err = h
        .service
        .update(&mut bob, &created.public_id, rename.clone())
        .await
        .unwrap_err();
    assert!(matches!(err, SnippetError::PermissionDenied(_)));
    assert!(matches!(
        h.service.delete(&bob, &created.public_id).await,
        Err(SnippetError::PermissionDenied(_))
    ));

    bob.capabilities.push("snippets:manage".into());
    let renamed = h
        .service
        .update(&mut bob, &created.public_id, rename)
        .await
        .unwrap();
    assert_eq!(renamed.title, "Stolen");
}

#[tokio::test]
async fn test_soft_delete_hides_snippet() {
    let h = harness();
    let mut user = h.user_with_budget("alice", 60_000);
    let created = h
        .service
        .create(&mut user, request("Short lived", &["0.13.1"]))
        .await
        .unwrap();

    h.service.delete(&user, &created.public_id).await.unwrap();

    assert!(matches!(
        h.service.get(&created.public_id, Some(&user)).await,
        Err(SnippetError::NotFound(_))
    ));
    let page = h.service.list(Some(&user), SnippetQuery::new()).await.unwrap();
    assert_eq!(page.total, 0);
    // the row is still there for trashed queries
    assert_eq!(h.snippet_count().await, 1);

    assert_eq!(h.service.purge_owner(user.id).await.unwrap(), 1);
    assert_eq!(h.snippet_count().await, 0);
}

#[tokio::test]
async fn test_list_filters_and_visibility() {
    let h = harness();
    let cetz = h.store.insert_package("preview", "cetz").unwrap();
    assert!(cetz > 0);
    let mut alice = h.user_with_budget("alice", 60_000);
    let bob = h.user_with_budget("bob", 60_000);

    let mut plot = request("Plot with cetz", &["0.13.0"]);
    plot.packages = vec![
        PackageUsage {
            namespace: "preview".into(),
            name: "cetz".into(),
            version: "0.2.2".into(),
        },
        PackageUsage {
            namespace: "preview".into(),
            name: "missing".into(),
            version: "1.0.0".into(),
        },
    ];
    let plot = h.service.create(&mut alice, plot).await.unwrap();
    assert_eq!(plot.packages.len(), 1);

    let mut private = request("Private notes", &["0.14.0"]);
    private.is_public = false;
    h.service.create(&mut alice, private).await.unwrap();

    let anonymous = h.service.list(None, SnippetQuery::new()).await.unwrap();
    assert_eq!(anonymous.total, 1);
    let other = h.service.list(Some(&bob), SnippetQuery::new()).await.unwrap();
    assert_eq!(other.total, 1);
    let own = h.service.list(Some(&alice), SnippetQuery::new()).await.unwrap();
    assert_eq!(own.total, 2);

    let by_version = h
        .service
        .list(Some(&alice), SnippetQuery::new().rendered_with("0.13"))
        .await
        .unwrap();
    assert_eq!(by_version.total, 1);
    assert_eq!(by_version.snippets[0].public_id, plot.public_id);

    let by_package = h
        .service
        .list(
            None,
            SnippetQuery::new().using_package(PackageFilter {
                namespace: "preview".into(),
                name: "cetz".into(),
                version: Some("0.2.2".into()),
            }),
        )
        .await
        .unwrap();
    assert_eq!(by_package.total, 1);

    let searched = h
        .service
        .list(Some(&alice), SnippetQuery::new().matching("NOTES"))
        .await
        .unwrap();
    assert_eq!(searched.total, 1);
}

#[tokio::test]
async fn test_concurrent_creates_share_one_budget() {
    let h = harness();
    h.renderer.answer("0.14.0", Outcome::Ok(4_000));
    let user = h.user_with_budget("alice", 5_000);
    let (mut first, mut second) = (user.clone(), user.clone());

    let (a, b) = tokio::join!(
        h.service.create(&mut first, request("First table", &["0.14.0"])),
        h.service.create(&mut second, request("Second table", &["0.14.0"])),
    );

    let outcomes = [a, b];
    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(outcomes.iter().any(|r| matches!(
        r,
        Err(SnippetError::InsufficientBudget {
            stage: BudgetStage::BeforeStart
        })
    )));
    assert_eq!(h.renderer.calls().len(), 1);
    assert_eq!(h.stored_balance(&user), 1_000);
    assert_eq!(h.snippet_count().await, 1);
}

#[tokio::test]
async fn test_concurrent_creates_of_different_users_are_both_stored() {
    let h = harness();
    let mut alice = h.user_with_budget("alice", 60_000);
    let mut bob = h.user_with_budget("bob", 60_000);

    let (a, b) = tokio::join!(
        h.service.create(&mut alice, request("Alice table", &["0.13.1"])),
        h.service.create(&mut bob, request("Bob table", &["0.13.1"])),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.id, b.id);
    assert_eq!(h.snippet_count().await, 2);
    assert!(h.service.get(&a.public_id, None).await.is_ok());
    assert!(h.service.get(&b.public_id, None).await.is_ok());
}
