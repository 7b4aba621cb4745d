//! Integration tests for the command pipeline and the job engine.
//!
//! Everything runs against the in-memory store with a manual clock:
//! Command → Interceptors → Session flush → Store, and
//! Acquire → Execute → Retry / Dead-letter → Service queries.

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier, Mutex, mpsc};
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    use conveyor_core::{Clock, EngineError, EngineResult, Entity, ExecutorId, JobId, ManualClock};

    use crate::command::{
        CloseListener, CommandAuthorizer, CommandConfig, CommandContext, CommandExecutor,
        EngineConfiguration, EntityOrder, FnCommand, QueryMatcher,
    };
    use crate::config::{AsyncExecutorConfig, JobConfig};
    use crate::jobs::{
        self, AcquireJobsCmd, AcquireTimerJobsCmd, AsyncExecutor, JobError, JobFilter,
        JobHandlerRegistry, JobOutcome, JobRecord, JobService, JobState, MoveTimerToExecutableCmd,
        NewJob, ResetExpiredJobsCmd, UnacquireJobCmd, execute_job,
    };
    use crate::store::{Filter, ForeignKey, ID_FIELD, InMemoryStore, Query};

    const START_MS: i64 = 1_700_000_000_000;

    // ------------------------------------------------------------------
    // Test entities
    // ------------------------------------------------------------------

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Folder {
        id: String,
        #[serde(skip)]
        revision: u64,
        name: String,
    }

    impl Entity for Folder {
        const TABLE: &'static str = "folder";

        fn id(&self) -> String {
            self.id.clone()
        }

        fn revision(&self) -> u64 {
            self.revision
        }

        fn set_revision(&mut self, revision: u64) {
            self.revision = revision;
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        #[serde(skip)]
        revision: u64,
        text: String,
        #[serde(default)]
        folder_id: Option<String>,
    }

    impl Entity for Note {
        const TABLE: &'static str = "note";

        fn id(&self) -> String {
            self.id.clone()
        }

        fn revision(&self) -> u64 {
            self.revision
        }

        fn set_revision(&mut self, revision: u64) {
            self.revision = revision;
        }
    }

    fn note(id: &str, text: &str) -> Note {
        Note {
            id: id.to_string(),
            revision: 0,
            text: text.to_string(),
            folder_id: None,
        }
    }

    fn folder(id: &str) -> Folder {
        Folder {
            id: id.to_string(),
            revision: 0,
            name: id.to_uppercase(),
        }
    }

    // ------------------------------------------------------------------
    // Harness
    // ------------------------------------------------------------------

    struct Harness {
        store: InMemoryStore,
        clock: Arc<ManualClock>,
        executor: CommandExecutor,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(JobHandlerRegistry::new(), JobConfig::default())
        }

        fn with(handlers: JobHandlerRegistry, job_config: JobConfig) -> Self {
            let store = InMemoryStore::with_foreign_keys(jobs::foreign_keys());
            let clock = Arc::new(ManualClock::at_epoch_millis(START_MS));
            let engine = EngineConfiguration::builder(Arc::new(store.clone()))
                .with_clock(Arc::clone(&clock) as Arc<dyn Clock>)
                .with_handlers(handlers)
                .with_job_config(job_config)
                .build();
            Self {
                store,
                clock,
                executor: CommandExecutor::new(engine),
            }
        }

        fn now(&self) -> DateTime<Utc> {
            self.clock.now()
        }

        fn advance(&self, seconds: i64) {
            self.clock.advance(chrono::Duration::seconds(seconds));
        }

        fn service(&self) -> JobService {
            JobService::new(self.executor.clone())
        }

        fn record(&self, handler_type: &str) -> JobRecord {
            NewJob::new(handler_type).into_record(self.now(), 3)
        }

        /// Insert straight into the executable table, lock fields included.
        fn insert(&self, job: JobRecord) -> JobRecord {
            let stored = job.clone();
            self.executor
                .execute_fn(CommandConfig::default(), "InsertJob", |ctx| {
                    ctx.entities()?.insert(jobs::JobEntity(stored))?;
                    Ok(())
                })
                .unwrap();
            job
        }

        fn acquire(&self, executor_id: &ExecutorId, max_results: usize) -> Vec<JobRecord> {
            self.executor
                .execute(
                    CommandConfig::default(),
                    AcquireJobsCmd {
                        executor_id: executor_id.clone(),
                        max_results,
                        lock_duration: Duration::from_secs(300),
                        tenant_id: None,
                    },
                )
                .unwrap()
        }

        fn move_due_timers(&self, executor_id: &ExecutorId) -> usize {
            let timers = self
                .executor
                .execute(
                    CommandConfig::default(),
                    AcquireTimerJobsCmd {
                        executor_id: executor_id.clone(),
                        max_results: 10,
                        lock_duration: Duration::from_secs(300),
                        tenant_id: None,
                    },
                )
                .unwrap();
            timers
                .iter()
                .filter(|t| {
                    self.executor
                        .execute(
                            CommandConfig::default(),
                            MoveTimerToExecutableCmd {
                                timer_id: t.id,
                                executor_id: executor_id.clone(),
                            },
                        )
                        .unwrap()
                        .is_some()
                })
                .count()
        }

        fn execute(&self, job_id: JobId, executor_id: &ExecutorId) -> JobOutcome {
            execute_job(&self.executor, job_id, executor_id)
        }

        fn state_of(&self, id: JobId) -> Option<(JobState, JobRecord)> {
            self.service().get_job(id).unwrap()
        }

        fn rows(&self, table: &str) -> usize {
            self.store.committed_rows(table).len()
        }
    }

    fn executor_id(name: &str) -> ExecutorId {
        ExecutorId::from_string(name)
    }

    fn pipeline(order: EntityOrder, foreign_keys: Vec<ForeignKey>) -> (InMemoryStore, CommandExecutor) {
        let store = InMemoryStore::with_foreign_keys(foreign_keys);
        let engine = EngineConfiguration::builder(Arc::new(store.clone()))
            .with_entity_order(order)
            .build();
        (store, CommandExecutor::new(engine))
    }

    fn seed_notes(executor: &CommandExecutor, notes: &[(&str, &str)]) {
        executor
            .execute_fn(CommandConfig::default(), "Seed", |ctx| {
                let mut em = ctx.entities()?;
                for (id, text) in notes {
                    em.insert(note(id, text))?;
                }
                Ok(())
            })
            .unwrap();
    }

    // ------------------------------------------------------------------
    // Command pipeline
    // ------------------------------------------------------------------

    #[test]
    fn nested_command_joins_the_active_context() {
        let (_, executor) = pipeline(EntityOrder::default(), Vec::new());

        executor
            .execute_fn(CommandConfig::default(), "Outer", |ctx| {
                let outer = ctx.entities()?.insert(note("n1", "draft"))?;
                let seen = ctx.execute(
                    CommandConfig::default(),
                    FnCommand::new("Inner", |ctx: &mut CommandContext| {
                        ctx.entities()?.find_by_id::<Note>("n1")
                    }),
                )?;
                let seen = seen.expect("nested command sees the staged insert");
                assert!(Rc::ptr_eq(&outer, &seen));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn requires_new_commits_independently_of_a_failing_parent() {
        let (store, executor) = pipeline(EntityOrder::default(), Vec::new());

        let result = executor.execute_fn(CommandConfig::default(), "Outer", |ctx| {
            ctx.entities()?.insert(note("outer", "x"))?;
            ctx.execute(
                CommandConfig::requiring_new(),
                FnCommand::new("Inner", |ctx: &mut CommandContext| {
                    ctx.entities()?.insert(note("inner", "y"))?;
                    Ok(())
                }),
            )?;
            Err::<(), _>(EngineError::invalid_argument("abort"))
        });

        assert_eq!(result, Err(EngineError::invalid_argument("abort")));
        let ids: Vec<_> = store.committed_rows("note").into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["inner".to_string()]);
    }

    #[test]
    fn failing_body_rolls_back_and_propagates_the_original_error() {
        let (store, executor) = pipeline(EntityOrder::default(), Vec::new());

        let err = executor
            .execute_fn(CommandConfig::default(), "Broken", |ctx| {
                ctx.entities()?.insert(note("n1", "lost"))?;
                Err::<(), _>(EngineError::handler("boom", true))
            })
            .unwrap_err();

        assert_eq!(err, EngineError::handler("boom", true));
        assert!(store.committed_rows("note").is_empty());
    }

    struct Recorder(Rc<RefCell<Vec<&'static str>>>);

    impl CloseListener for Recorder {
        fn closing(&mut self, _ctx: &mut CommandContext) -> EngineResult<()> {
            self.0.borrow_mut().push("closing");
            Ok(())
        }

        fn after_sessions_flushed(&mut self, ctx: &mut CommandContext) -> EngineResult<()> {
            // the transaction listener registered first has already committed
            assert!(!ctx.has_transaction());
            self.0.borrow_mut().push("flushed");
            Ok(())
        }

        fn closed(&mut self, _ctx: &mut CommandContext) {
            self.0.borrow_mut().push("closed");
        }

        fn close_failure(&mut self, _ctx: &mut CommandContext, _error: &EngineError) {
            self.0.borrow_mut().push("failure");
        }
    }

    #[test]
    fn close_listeners_run_in_phase_order() {
        let (_, executor) = pipeline(EntityOrder::default(), Vec::new());

        let phases = Rc::new(RefCell::new(Vec::new()));
        executor
            .execute_fn(CommandConfig::default(), "Ok", |ctx| {
                ctx.add_close_listener(Box::new(Recorder(Rc::clone(&phases))));
                Ok(())
            })
            .unwrap();
        assert_eq!(*phases.borrow(), vec!["closing", "flushed", "closed"]);

        let phases = Rc::new(RefCell::new(Vec::new()));
        let _ = executor.execute_fn(CommandConfig::default(), "Fails", |ctx| {
            ctx.add_close_listener(Box::new(Recorder(Rc::clone(&phases))));
            Err::<(), _>(EngineError::illegal_state("nope"))
        });
        assert_eq!(*phases.borrow(), vec!["failure"]);
    }

    #[test]
    fn concurrent_modification_surfaces_as_optimistic_lock_conflict() {
        let (store, executor) = pipeline(EntityOrder::default(), Vec::new());
        seed_notes(&executor, &[("n1", "v1")]);

        let err = executor
            .execute_fn(CommandConfig::default(), "Edit", |ctx| {
                let mine = ctx.entities()?.get::<Note>("n1")?;
                ctx.execute(
                    CommandConfig::requiring_new(),
                    FnCommand::new("ConcurrentEdit", |ctx: &mut CommandContext| {
                        let theirs = ctx.entities()?.get::<Note>("n1")?;
                        theirs.borrow_mut().text = "theirs".to_string();
                        Ok(())
                    }),
                )?;
                mine.borrow_mut().text = "mine".to_string();
                Ok(())
            })
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(err.is_retryable());
        let rows = store.committed_rows("note");
        assert_eq!(rows[0].data["text"], "theirs");
        assert_eq!(rows[0].revision, 2);
    }

    struct DenyCommand(&'static str);

    impl CommandAuthorizer for DenyCommand {
        fn authorize(&self, command: &str, config: &CommandConfig) -> EngineResult<()> {
            if command == self.0 {
                return Err(EngineError::unauthorized(format!(
                    "{} may not run {command}",
                    config.actor.as_deref().unwrap_or("anonymous")
                )));
            }
            Ok(())
        }
    }

    #[test]
    fn authorizer_can_reject_a_command_before_it_runs() {
        let store = InMemoryStore::new();
        let engine = EngineConfiguration::builder(Arc::new(store.clone()))
            .with_authorizer(Arc::new(DenyCommand("Purge")))
            .build();
        let executor = CommandExecutor::new(engine);

        let ran = AtomicUsize::new(0);
        let err = executor
            .execute_fn(CommandConfig::default().with_actor("mallory"), "Purge", |_| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap_err();
        assert_eq!(err, EngineError::unauthorized("mallory may not run Purge"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        executor
            .execute_fn(CommandConfig::default(), "Read", |_| Ok(()))
            .unwrap();
    }

    // ------------------------------------------------------------------
    // Sessions and the entity cache
    // ------------------------------------------------------------------

    #[test]
    fn identity_map_and_query_matcher_see_in_memory_changes() {
        let (_, executor) = pipeline(EntityOrder::default(), Vec::new());
        seed_notes(&executor, &[("a", "todo"), ("b", "todo"), ("c", "done")]);

        executor
            .execute_fn(CommandConfig::default(), "Query", |ctx| {
                let mut em = ctx.entities()?;
                let a = em.get::<Note>("a")?;
                assert!(Rc::ptr_eq(&a, &em.get::<Note>("a")?));
                a.borrow_mut().text = "done".to_string();

                let todo = Query::new().filter(Filter::eq("text", "todo"));
                let found = em.find_by_query::<Note>(&todo, &QueryMatcher::new(&todo))?;
                let ids: Vec<_> = found.iter().map(|n| n.borrow().id.clone()).collect();
                assert_eq!(ids, vec!["b".to_string()]);
                assert!(Rc::ptr_eq(&found[0], &em.get::<Note>("b")?));

                let done = Query::new().filter(Filter::eq("text", "done"));
                let found = em.find_by_query::<Note>(&done, &QueryMatcher::new(&done))?;
                assert_eq!(found.len(), 2);
                assert!(found.iter().any(|n| Rc::ptr_eq(n, &a)));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn cached_rows_do_not_hide_earlier_store_rows_from_a_limited_query() {
        let (_, executor) = pipeline(EntityOrder::default(), Vec::new());
        seed_notes(&executor, &[("a", "one"), ("b", "two")]);

        executor
            .execute_fn(CommandConfig::default(), "FirstNote", |ctx| {
                let mut em = ctx.entities()?;
                let b = em.get::<Note>("b")?;

                let first = Query::new().order_asc(ID_FIELD).limit(1);
                let found = em.find_by_query::<Note>(&first, &QueryMatcher::new(&first))?;
                let ids: Vec<_> = found.iter().map(|n| n.borrow().id.clone()).collect();
                assert_eq!(ids, vec!["a".to_string()]);

                let last = Query::new().order_desc(ID_FIELD).limit(1);
                let found = em.find_by_query::<Note>(&last, &QueryMatcher::new(&last))?;
                assert!(Rc::ptr_eq(&found[0], &b));
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn only_dirty_entities_are_written_at_flush() {
        let (store, executor) = pipeline(EntityOrder::default(), Vec::new());
        seed_notes(&executor, &[("a", "one"), ("b", "two")]);

        executor
            .execute_fn(CommandConfig::default(), "Touch", |ctx| {
                let mut em = ctx.entities()?;
                let _untouched = em.get::<Note>("a")?;
                em.get::<Note>("b")?.borrow_mut().text = "three".to_string();
                Ok(())
            })
            .unwrap();

        let rows = store.committed_rows("note");
        let revision = |id: &str| rows.iter().find(|r| r.id == id).map(|r| r.revision);
        assert_eq!(revision("a"), Some(1));
        assert_eq!(revision("b"), Some(2));
    }

    #[test]
    fn flush_orders_inserts_parents_first_and_deletes_children_first() {
        let fk = vec![ForeignKey::new("note", "folder_id", "folder")];
        let (store, executor) = pipeline(EntityOrder::new(["folder", "note"]), fk);

        executor
            .execute_fn(CommandConfig::default(), "Create", |ctx| {
                let mut em = ctx.entities()?;
                let mut child = note("n1", "inside");
                child.folder_id = Some("f1".to_string());
                // staged child first; flush still inserts the folder before it
                em.insert(child)?;
                em.insert(folder("f1"))?;
                Ok(())
            })
            .unwrap();
        assert_eq!(store.committed_rows("folder").len(), 1);
        assert_eq!(store.committed_rows("note").len(), 1);

        executor
            .execute_fn(CommandConfig::default(), "Remove", |ctx| {
                let mut em = ctx.entities()?;
                let parent = em.get::<Folder>("f1")?;
                let child = em.get::<Note>("n1")?;
                em.delete(&parent)?;
                em.delete(&child)?;
                Ok(())
            })
            .unwrap();
        assert!(store.committed_rows("folder").is_empty());
        assert!(store.committed_rows("note").is_empty());
    }

    #[test]
    fn without_a_dependency_order_the_foreign_key_rejects_the_flush() {
        let fk = vec![ForeignKey::new("note", "folder_id", "folder")];
        let (store, executor) = pipeline(EntityOrder::default(), fk);

        let err = executor
            .execute_fn(CommandConfig::default(), "Create", |ctx| {
                let mut em = ctx.entities()?;
                let mut child = note("n1", "orphan");
                child.folder_id = Some("f1".to_string());
                em.insert(child)?;
                em.insert(folder("f1"))?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Constraint(_)));
        assert!(store.committed_rows("folder").is_empty());
    }

    // ------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------

    #[test]
    fn acquire_skips_jobs_under_a_live_lease() {
        let h = Harness::new();
        for _ in 0..3 {
            h.insert(h.record("work"));
        }
        for _ in 0..2 {
            let mut locked = h.record("work");
            locked.lock_owner = Some("someone-else".to_string());
            locked.lock_expiration_time = Some(h.now() + chrono::Duration::seconds(60));
            h.insert(locked);
        }

        let me = executor_id("me");
        let claimed = h.acquire(&me, 5);
        assert_eq!(claimed.len(), 3);
        for job in &claimed {
            assert_eq!(job.lock_owner.as_deref(), Some("me"));
            assert_eq!(
                job.lock_expiration_time,
                Some(h.now() + chrono::Duration::seconds(300))
            );
        }
        assert!(h.acquire(&executor_id("late"), 5).is_empty());
    }

    #[test]
    fn expired_lease_is_reclaimable_by_another_executor() {
        let h = Harness::new();
        let job = h.insert(h.record("work"));

        let first = executor_id("crashed");
        assert_eq!(h.acquire(&first, 1).len(), 1);
        h.advance(299);
        assert!(h.acquire(&executor_id("eager"), 1).is_empty());

        h.advance(1);
        let second = executor_id("rescuer");
        let claimed = h.acquire(&second, 1);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);

        // the original holder no longer owns the job
        assert_eq!(h.execute(job.id, &first), JobOutcome::Skipped);
    }

    #[test]
    fn acquisition_ignores_future_suspended_and_dead_letter_jobs() {
        let h = Harness::new();
        let service = h.service();
        let due = service.create_job(NewJob::new("work")).unwrap();
        let future = service
            .create_job(NewJob::new("work").due_at(h.now() + chrono::Duration::minutes(5)))
            .unwrap();
        let parked = service.create_job(NewJob::new("work")).unwrap();
        service.suspend(parked.id).unwrap();
        let dead = service.create_job(NewJob::new("work")).unwrap();
        service.move_to_dead_letter(dead.id).unwrap();

        let claimed = h.acquire(&executor_id("me"), 10);
        assert_eq!(claimed.iter().map(|j| j.id).collect::<Vec<_>>(), vec![due.id]);
        assert_eq!(h.state_of(future.id).map(|(s, _)| s), Some(JobState::Timer));
        assert_eq!(h.state_of(parked.id).map(|(s, _)| s), Some(JobState::Suspended));
        assert_eq!(h.state_of(dead.id).map(|(s, _)| s), Some(JobState::DeadLetter));
    }

    #[test]
    fn acquisition_orders_by_due_date_and_honours_the_batch_size() {
        let h = Harness::new();
        let mut late = h.record("work");
        late.due_date = Some(h.now() - chrono::Duration::seconds(1));
        let mut early = h.record("work");
        early.due_date = Some(h.now() - chrono::Duration::seconds(30));
        let immediate = h.record("work");
        let (late, early, immediate) = (h.insert(late), h.insert(early), h.insert(immediate));

        let claimed = h.acquire(&executor_id("me"), 2);
        let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
        // no due date sorts first
        assert_eq!(ids, vec![immediate.id, early.id]);
        assert_eq!(h.acquire(&executor_id("me"), 2)[0].id, late.id);
    }

    #[test]
    fn tenant_scoped_acquisition_only_sees_its_tenant() {
        let h = Harness::new();
        let service = h.service();
        let acme = service.create_job(NewJob::new("work").for_tenant("acme")).unwrap();
        service.create_job(NewJob::new("work").for_tenant("globex")).unwrap();

        let claimed = h
            .executor
            .execute(
                CommandConfig::default(),
                AcquireJobsCmd {
                    executor_id: executor_id("acme-node"),
                    max_results: 10,
                    lock_duration: Duration::from_secs(60),
                    tenant_id: Some("acme".to_string()),
                },
            )
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, acme.id);
    }

    #[test]
    fn concurrent_executors_claim_each_job_exactly_once() {
        let h = Harness::new();
        let jobs: Vec<_> = (0..5).map(|_| h.insert(h.record("work"))).collect();

        let contenders = 8;
        let barrier = Barrier::new(contenders);
        let claimed: Vec<JobId> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..contenders)
                .map(|i| {
                    let h = &h;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        h.acquire(&executor_id(&format!("node-{i}")), 5)
                            .into_iter()
                            .map(|j| j.id)
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        let mut claimed_sorted = claimed.clone();
        claimed_sorted.sort_by_key(|id| id.to_string());
        claimed_sorted.dedup();
        assert_eq!(claimed.len(), jobs.len(), "every job claimed once");
        assert_eq!(claimed_sorted.len(), jobs.len(), "no job claimed twice");
    }

    #[test]
    fn exclusive_jobs_of_one_scope_never_run_concurrently() {
        let h = Harness::with(registry_with("work", |_, _| Ok(())), JobConfig::default());
        let service = h.service();
        let job = |scope: &str, exclusive: bool, age: i64| {
            service
                .create_job(
                    NewJob::new("work")
                        .due_at(h.now() - chrono::Duration::seconds(age))
                        .in_scope("process", scope)
                        .exclusive(exclusive),
                )
                .unwrap()
        };
        let first = job("p1", true, 40);
        let second = job("p1", true, 30);
        let other_scope = job("p2", true, 20);
        let shared = job("p1", false, 10);

        let a = executor_id("a");
        let claimed: Vec<_> = h.acquire(&a, 10).into_iter().map(|j| j.id).collect();
        assert_eq!(claimed, vec![first.id, other_scope.id, shared.id]);

        let b = executor_id("b");
        assert!(h.acquire(&b, 10).is_empty(), "scope p1 is still leased");

        assert_eq!(h.execute(first.id, &a), JobOutcome::Completed);
        let claimed: Vec<_> = h.acquire(&b, 10).into_iter().map(|j| j.id).collect();
        assert_eq!(claimed, vec![second.id]);
        assert_eq!(h.rows(jobs::SCOPE_LOCK_TABLE), 2);
    }

    #[test]
    fn lock_recovery_resets_expired_leases() {
        let h = Harness::new();
        let service = h.service();
        let job = service
            .create_job(NewJob::new("work").in_scope("case", "c1").exclusive(true))
            .unwrap();
        assert_eq!(h.acquire(&executor_id("crashed"), 1).len(), 1);
        assert_eq!(h.rows(jobs::SCOPE_LOCK_TABLE), 1);

        let reset = |page_size| {
            h.executor
                .execute(CommandConfig::default(), ResetExpiredJobsCmd { page_size })
                .unwrap()
        };
        assert_eq!(reset(10), 0);

        h.advance(301);
        assert_eq!(reset(10), 1);
        let (state, record) = h.state_of(job.id).unwrap();
        assert_eq!(state, JobState::Executable);
        assert_eq!(record.lock_owner, None);
        assert_eq!(record.lock_expiration_time, None);
        assert_eq!(h.rows(jobs::SCOPE_LOCK_TABLE), 0);

        assert_eq!(h.acquire(&executor_id("rescuer"), 1).len(), 1);
    }

    #[test]
    fn unacquire_releases_only_own_claims() {
        let h = Harness::new();
        let job = h.insert(h.record("work"));
        let owner = executor_id("owner");
        h.acquire(&owner, 1);

        let unacquire = |who: &ExecutorId| {
            h.executor
                .execute(
                    CommandConfig::default(),
                    UnacquireJobCmd {
                        job_id: job.id,
                        executor_id: who.clone(),
                    },
                )
                .unwrap()
        };
        assert!(!unacquire(&executor_id("intruder")));
        assert!(unacquire(&owner));
        assert_eq!(h.acquire(&executor_id("next"), 1).len(), 1);
    }

    // ------------------------------------------------------------------
    // Execution, retry and dead-lettering
    // ------------------------------------------------------------------

    fn registry_with<F>(handler_type: &str, f: F) -> JobHandlerRegistry
    where
        F: Fn(&JobRecord, &mut CommandContext) -> Result<(), JobError> + Send + Sync + 'static,
    {
        let mut registry = JobHandlerRegistry::new();
        registry.register_fn(handler_type, f);
        registry
    }

    #[test]
    fn successful_job_disappears_from_every_table() {
        let registry = registry_with("note.write", |job, ctx| {
            let text = job.job_handler_config.clone().unwrap_or_default();
            ctx.entities()?.insert(note(&job.id.to_string(), &text))?;
            Ok(())
        });
        let h = Harness::with(registry, JobConfig::default().with_history(true));
        let job = h
            .service()
            .create_job(NewJob::new("note.write").with_config("hello"))
            .unwrap();

        let me = executor_id("me");
        h.acquire(&me, 1);
        assert_eq!(h.execute(job.id, &me), JobOutcome::Completed);

        assert_eq!(h.state_of(job.id), None);
        for state in JobState::ALL {
            assert_eq!(h.rows(state.table()), 0, "{state:?}");
        }
        let notes = h.store.committed_rows("note");
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].data["text"], "hello");
        let history = h.store.committed_rows(jobs::JOB_HISTORY_TABLE);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].data["outcome"], "completed");
    }

    #[test]
    fn always_failing_job_retries_with_doubling_backoff_then_dead_letters() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let registry = registry_with("flaky", move |_, _| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Err(JobError::retryable(format!("boom #{n}")))
        });
        let h = Harness::with(registry, JobConfig::default());
        let job = h
            .service()
            .create_job(NewJob::new("flaky").with_retries(2))
            .unwrap();
        let me = executor_id("me");

        // first failure: 10s backoff
        h.acquire(&me, 1);
        let expected_due = h.now() + chrono::Duration::seconds(10);
        assert_eq!(
            h.execute(job.id, &me),
            JobOutcome::Retried {
                due_date: expected_due,
                retries_left: 1
            }
        );
        let (state, record) = h.state_of(job.id).unwrap();
        assert_eq!(state, JobState::Timer);
        assert_eq!(record.retries, 1);
        assert_eq!(record.lock_owner, None);
        assert!(record.exception_message.as_deref().unwrap().contains("boom #1"));

        assert_eq!(h.move_due_timers(&me), 0, "not due yet");
        h.advance(10);
        assert_eq!(h.move_due_timers(&me), 1);

        // second failure: 20s backoff
        assert_eq!(h.acquire(&me, 1).len(), 1);
        let expected_due = h.now() + chrono::Duration::seconds(20);
        assert_eq!(
            h.execute(job.id, &me),
            JobOutcome::Retried {
                due_date: expected_due,
                retries_left: 0
            }
        );

        h.advance(20);
        assert_eq!(h.move_due_timers(&me), 1);
        assert_eq!(h.acquire(&me, 1).len(), 1);
        assert_eq!(h.execute(job.id, &me), JobOutcome::DeadLettered);

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let (state, record) = h.state_of(job.id).unwrap();
        assert_eq!(state, JobState::DeadLetter);
        assert_eq!(record.retries, 0);
        assert_eq!(record.attempt, 3);
        assert!(record.exception_message.as_deref().unwrap().contains("boom #3"));
        assert_eq!(h.rows(jobs::JOB_TABLE), 0);
        assert_eq!(h.rows(jobs::TIMER_JOB_TABLE), 0);

        // only the latest failure is kept
        assert_eq!(h.rows(jobs::ERROR_DETAILS_TABLE), 1);
        let details = h.service().error_details(job.id).unwrap().unwrap();
        assert!(details.message.contains("boom #3"));

        // dead letters are never acquired again
        h.advance(3600);
        assert_eq!(h.move_due_timers(&me), 0);
        assert!(h.acquire(&me, 10).is_empty());

        // a requeued job starts over from the base delay
        let requeued = h.service().requeue_dead_letter(job.id, 1).unwrap();
        assert_eq!((requeued.retries, requeued.attempt), (1, 0));
        assert_eq!(h.acquire(&me, 1).len(), 1);
        let expected_due = h.now() + chrono::Duration::seconds(10);
        assert_eq!(
            h.execute(job.id, &me),
            JobOutcome::Retried {
                due_date: expected_due,
                retries_left: 0
            }
        );
        assert_eq!(h.state_of(job.id).unwrap().1.attempt, 1);
    }

    #[test]
    fn non_retryable_failure_dead_letters_immediately() {
        let registry = registry_with("strict", |_, _| Err(JobError::non_retryable("bad input")));
        let h = Harness::with(registry, JobConfig::default());
        let job = h.service().create_job(NewJob::new("strict")).unwrap();
        let me = executor_id("me");

        h.acquire(&me, 1);
        assert_eq!(h.execute(job.id, &me), JobOutcome::DeadLettered);
        let (state, record) = h.state_of(job.id).unwrap();
        assert_eq!(state, JobState::DeadLetter);
        assert_eq!(record.retries, 3, "no retry consumed");
        assert!(record.exception_message.unwrap().contains("bad input"));
    }

    #[test]
    fn missing_handler_is_a_consistency_error_and_dead_letters() {
        let h = Harness::new();
        let job = h.service().create_job(NewJob::new("unknown.kind")).unwrap();
        let me = executor_id("me");

        h.acquire(&me, 1);
        assert_eq!(h.execute(job.id, &me), JobOutcome::DeadLettered);
        let (_, record) = h.state_of(job.id).unwrap();
        assert!(
            record
                .exception_message
                .unwrap()
                .contains("no handler registered for job type 'unknown.kind'")
        );
    }

    #[test]
    fn constraint_violation_at_flush_dead_letters_without_retrying() {
        let registry = registry_with("dup", |_, ctx| {
            ctx.entities()?.insert(note("taken", "again"))?;
            Ok(())
        });
        let h = Harness::with(registry, JobConfig::default());
        seed_notes(&h.executor, &[("taken", "first")]);
        let job = h
            .service()
            .create_job(NewJob::new("dup").with_retries(3))
            .unwrap();
        let me = executor_id("me");

        h.acquire(&me, 1);
        assert_eq!(h.execute(job.id, &me), JobOutcome::DeadLettered);
        let (state, record) = h.state_of(job.id).unwrap();
        assert_eq!(state, JobState::DeadLetter);
        assert_eq!(record.retries, 3);
        assert!(record.exception_message.unwrap().contains("constraint violation"));
    }

    #[test]
    fn handler_writes_roll_back_when_the_job_fails() {
        let registry = registry_with("half", |job, ctx| {
            ctx.entities()?.insert(note(&job.id.to_string(), "partial"))?;
            Err(JobError::retryable("half done"))
        });
        let h = Harness::with(registry, JobConfig::default());
        let job = h.service().create_job(NewJob::new("half")).unwrap();
        let me = executor_id("me");

        h.acquire(&me, 1);
        assert!(matches!(h.execute(job.id, &me), JobOutcome::Retried { .. }));
        assert!(h.store.committed_rows("note").is_empty());
    }

    #[test]
    fn conflicting_job_is_released_without_consuming_a_retry() {
        // the handler bumps the job row in a separate transaction, so the
        // revision-checked delete of the completed job conflicts
        let registry = registry_with("racy", |job, ctx| {
            let id = job.id.to_string();
            ctx.execute(
                CommandConfig::requiring_new(),
                FnCommand::new("Interfere", move |ctx: &mut CommandContext| {
                    let row = ctx.entities()?.get::<jobs::JobEntity>(&id)?;
                    row.borrow_mut().exception_message = Some("touched".to_string());
                    Ok(())
                }),
            )?;
            Ok(())
        });
        let h = Harness::with(registry, JobConfig::default());
        let job = h.service().create_job(NewJob::new("racy")).unwrap();
        let me = executor_id("me");

        h.acquire(&me, 1);
        assert_eq!(h.execute(job.id, &me), JobOutcome::Released);
        let (state, record) = h.state_of(job.id).unwrap();
        assert_eq!(state, JobState::Executable);
        assert_eq!(record.retries, 3);
        assert_eq!(record.lock_owner, None);
    }

    #[test]
    fn panicking_handler_counts_as_a_retryable_failure() {
        let registry = registry_with("panics", |_, _| panic!("handler exploded"));
        let h = Harness::with(registry, JobConfig::default());
        let job = h.service().create_job(NewJob::new("panics")).unwrap();
        let me = executor_id("me");

        h.acquire(&me, 1);
        assert!(matches!(h.execute(job.id, &me), JobOutcome::Retried { retries_left: 2, .. }));
        let (_, record) = h.state_of(job.id).unwrap();
        assert!(record.exception_message.unwrap().contains("handler exploded"));
    }

    #[test]
    fn handler_backoff_overrides_the_engine_default() {
        struct Quick(jobs::RetryBackoff);

        impl jobs::JobHandler for Quick {
            fn handler_type(&self) -> &str {
                "quick"
            }

            fn execute(&self, _: &JobRecord, _: &mut CommandContext) -> Result<(), JobError> {
                Err(JobError::retryable("again"))
            }

            fn backoff(&self) -> Option<&dyn jobs::BackoffPolicy> {
                Some(&self.0)
            }
        }

        let quick = Quick(jobs::RetryBackoff::fixed(Duration::from_secs(1)));
        let h = Harness::with(JobHandlerRegistry::new().with(Arc::new(quick)), JobConfig::default());
        let job = h.service().create_job(NewJob::new("quick")).unwrap();
        let me = executor_id("me");
        h.acquire(&me, 1);
        assert_eq!(
            h.execute(job.id, &me),
            JobOutcome::Retried {
                due_date: h.now() + chrono::Duration::seconds(1),
                retries_left: 2
            }
        );
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    #[test]
    fn dead_letter_requeue_and_statistics() {
        let h = Harness::new();
        let service = h.service();
        let a = service.create_job(NewJob::new("report.daily")).unwrap();
        let b = service.create_job(NewJob::new("report.weekly")).unwrap();
        service
            .create_job(NewJob::new("report.daily").due_at(h.now() + chrono::Duration::hours(1)))
            .unwrap();

        service.move_to_dead_letter(a.id).unwrap();
        service.suspend(b.id).unwrap();
        let stats = service.stats().unwrap();
        assert_eq!(
            (stats.executable, stats.timers, stats.suspended, stats.dead_letter),
            (0, 1, 1, 1)
        );

        let dead = service
            .dead_letters(&JobFilter::new().handler_type("report.daily"))
            .unwrap();
        assert_eq!(dead.iter().map(|j| j.id).collect::<Vec<_>>(), vec![a.id]);

        let requeued = service.requeue_dead_letter(a.id, 5).unwrap();
        assert_eq!(requeued.retries, 5);
        assert_eq!(h.state_of(a.id).map(|(s, _)| s), Some(JobState::Executable));
        assert!(matches!(
            service.requeue_dead_letter(a.id, 5),
            Err(EngineError::NotFound { .. })
        ));

        let (state, _) = service.activate(b.id).unwrap();
        assert_eq!(state, JobState::Executable);

        let me = executor_id("me");
        assert_eq!(h.acquire(&me, 10).len(), 2);
        assert_eq!(service.stats().unwrap().locked, 2);
        assert!(matches!(service.suspend(a.id), Err(EngineError::IllegalState(_))));
        assert!(matches!(service.delete_job(a.id), Err(EngineError::IllegalState(_))));
    }

    #[test]
    fn delete_removes_the_job_and_its_error_details() {
        let registry = registry_with("fail", |_, _| Err(JobError::non_retryable("nope")));
        let h = Harness::with(registry, JobConfig::default());
        let service = h.service();
        let job = service.create_job(NewJob::new("fail")).unwrap();
        let me = executor_id("me");
        h.acquire(&me, 1);
        h.execute(job.id, &me);
        assert_eq!(h.rows(jobs::ERROR_DETAILS_TABLE), 1);

        let listed = service
            .list(JobState::DeadLetter, &JobFilter::new().with_exception())
            .unwrap();
        assert_eq!(listed.len(), 1);

        assert!(service.delete_job(job.id).unwrap());
        assert!(!service.delete_job(job.id).unwrap());
        assert_eq!(h.rows(jobs::DEADLETTER_JOB_TABLE), 0);
        assert_eq!(h.rows(jobs::ERROR_DETAILS_TABLE), 0);
    }

    #[test]
    fn create_rejects_an_empty_handler_type() {
        let h = Harness::new();
        assert!(matches!(
            h.service().create_job(NewJob::new("  ")),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    // ------------------------------------------------------------------
    // Executor runtime
    // ------------------------------------------------------------------

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while std::time::Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn running_executor_drains_all_due_jobs() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&done);
        let registry = registry_with("count", move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let h = Harness::with(registry, JobConfig::default());
        for _ in 0..12 {
            h.service().create_job(NewJob::new("count")).unwrap();
        }

        let config = AsyncExecutorConfig::default()
            .with_executor_name("it")
            .with_pool_size(2, 4)
            .with_queue_capacity(4)
            .with_batch_sizes(5, 5)
            .with_acquire_interval(Duration::from_millis(10))
            .with_reset_expired_interval(Duration::from_millis(50));
        let handle = AsyncExecutor::new(h.executor.clone(), config).start().unwrap();

        assert!(wait_until(Duration::from_secs(10), || done.load(Ordering::SeqCst) == 12));
        assert!(wait_until(Duration::from_secs(5), || h.rows(jobs::JOB_TABLE) == 0));
        let stats = handle.shutdown();
        assert_eq!(stats.jobs_completed, 12);
        assert_eq!(stats.jobs_dead_lettered, 0);
        assert!(stats.acquisition_cycles >= 3);
    }

    #[test]
    fn saturated_pool_shrinks_the_next_batch() {
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (started_tx, started_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let started_tx = Mutex::new(started_tx);
        let registry = registry_with("block", move |_, _| {
            let _ = started_tx.lock().unwrap().send(());
            let _ = release_rx.lock().unwrap().recv();
            Ok(())
        });
        let h = Harness::with(registry, JobConfig::default());
        for _ in 0..3 {
            h.service().create_job(NewJob::new("block")).unwrap();
        }

        let config = AsyncExecutorConfig::default()
            .with_pool_size(1, 1)
            .with_queue_capacity(0)
            .with_batch_sizes(10, 10);
        let executor = AsyncExecutor::new(h.executor.clone(), config);

        let first = executor.run_acquisition_cycle().unwrap();
        assert_eq!((first.requested, first.acquired, first.submitted), (1, 1, 1));
        started_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let second = executor.run_acquisition_cycle().unwrap();
        assert_eq!((second.requested, second.acquired), (0, 0));

        release_tx.send(()).unwrap();
        assert!(executor.pool().shutdown(Duration::from_secs(5)));
        assert_eq!(executor.stats().jobs_completed, 1);
        assert_eq!(h.rows(jobs::JOB_TABLE), 2);
        assert!(
            h.store
                .committed_rows(jobs::JOB_TABLE)
                .iter()
                .all(|r| r.data["lock_owner"].is_null())
        );
    }

    #[test]
    fn inactive_executor_starts_no_loops() {
        let h = Harness::new();
        h.service().create_job(NewJob::new("never")).unwrap();
        let mut config = AsyncExecutorConfig::default();
        config.activate = false;
        let handle = AsyncExecutor::new(h.executor.clone(), config).start().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        let stats = handle.shutdown();
        assert_eq!(stats.acquisition_cycles, 0);
        assert_eq!(h.rows(jobs::JOB_TABLE), 1);
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    #[derive(Debug, Clone, Copy)]
    enum Due {
        Unset,
        Past(i64),
        Now,
        Future(i64),
    }

    #[derive(Debug, Clone, Copy)]
    enum Lease {
        Free,
        Expired,
        Live,
    }

    fn due_strategy() -> impl Strategy<Value = Due> {
        prop_oneof![
            Just(Due::Unset),
            (1i64..100).prop_map(Due::Past),
            Just(Due::Now),
            (1i64..100).prop_map(Due::Future),
        ]
    }

    fn lease_strategy() -> impl Strategy<Value = Lease> {
        prop_oneof![Just(Lease::Free), Just(Lease::Expired), Just(Lease::Live)]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn acquisition_claims_the_earliest_eligible_jobs(
            specs in prop::collection::vec((due_strategy(), lease_strategy()), 0..12),
            max_results in 1usize..8,
        ) {
            let h = Harness::new();
            let now = h.now();
            let mut eligible = Vec::new();
            for (due, lease) in specs {
                let mut job = h.record("work");
                job.due_date = match due {
                    Due::Unset => None,
                    Due::Past(s) => Some(now - chrono::Duration::seconds(s)),
                    Due::Now => Some(now),
                    Due::Future(s) => Some(now + chrono::Duration::seconds(s)),
                };
                match lease {
                    Lease::Free => {}
                    Lease::Expired => {
                        job.lock_owner = Some("gone".to_string());
                        job.lock_expiration_time = Some(now - chrono::Duration::seconds(1));
                    }
                    Lease::Live => {
                        job.lock_owner = Some("busy".to_string());
                        job.lock_expiration_time = Some(now + chrono::Duration::seconds(1));
                    }
                }
                let job = h.insert(job);
                if job.is_due_at(now) && !job.is_locked_at(now) {
                    eligible.push(job);
                }
            }
            eligible.sort_by_key(|j| (j.due_date, j.id.to_string()));
            let expected: Vec<_> = eligible.iter().take(max_results).map(|j| j.id).collect();

            let me = executor_id("me");
            let claimed = h.acquire(&me, max_results);
            let ids: Vec<_> = claimed.iter().map(|j| j.id).collect();
            prop_assert_eq!(ids, expected);
            for job in &claimed {
                prop_assert_eq!(job.lock_owner.as_deref(), Some("me"));
                prop_assert!(job.is_locked_at(now));
            }
        }
    }
}
