//! Transactional scopes with compensating actions.
//!
//! Stages compose stacked acquisitions (snapshot, mounts, iSCSI targets,
//! symlinks); unwinding has to be deterministic even when the operator
//! interrupts the run, so the body is executed under `catch_unwind` and the
//! configured finisher runs exactly once on every path.
//!
//! Two shapes are provided: [`Transaction`] for a single prepare/finish
//! pair, and [`Scope`] for a stack of compensations pushed as resources are
//! acquired and unwound in reverse.

use std::panic::{self, AssertUnwindSafe};

use log::{error, info, warn};

use crate::error::{Error, Result};

type Prepare<'s, T> = Box<dyn FnOnce() -> Result<T> + 's>;
type Commit<'s, T> = Box<dyn FnOnce(T) -> Result<()> + 's>;
type Rollback<'s, T> = Box<dyn FnOnce(T, Option<&Error>) -> Result<()> + 's>;

/// A scoped transaction.
///
/// On enter the `prepare` callback runs and its value is handed to the
/// body. On normal exit whichever of `commit`/`finally` is configured runs;
/// on failure `rollback`/`finally` runs with the body's error. `finally` is
/// mutually exclusive with `commit`/`rollback`; mixing them is a programming
/// error caught at construction. Finisher errors are logged and never
/// suppress the body's error.
pub struct Transaction<'s, T> {
    prepare: (Option<String>, Prepare<'s, T>),
    commit: Option<(Option<String>, Commit<'s, T>)>,
    rollback: Option<(Option<String>, Rollback<'s, T>)>,
    finally: Option<(Option<String>, Rollback<'s, T>)>,
}

fn message(text: Option<&str>) -> Option<String> {
    text.map(str::to_string)
}

impl<'s> Transaction<'s, ()> {
    /// A transaction with no prepared value.
    pub fn new() -> Self {
        Transaction {
            prepare: (None, Box::new(|| Ok(()))),
            commit: None,
            rollback: None,
            finally: None,
        }
    }
}

impl<'s> Default for Transaction<'s, ()> {
    fn default() -> Self {
        Transaction::new()
    }
}

impl<'s, T> Transaction<'s, T> {
    /// A transaction whose prepared value is produced by `prepare`.
    pub fn prepare(text: Option<&str>, prepare: impl FnOnce() -> Result<T> + 's) -> Self {
        Transaction {
            prepare: (message(text), Box::new(prepare)),
            commit: None,
            rollback: None,
            finally: None,
        }
    }

    pub fn commit(mut self, text: Option<&str>, commit: impl FnOnce(T) -> Result<()> + 's) -> Self {
        assert!(
            self.finally.is_none(),
            "final action must only be present with no commit and rollback"
        );
        self.commit = Some((message(text), Box::new(commit)));
        self
    }

    pub fn rollback(
        mut self,
        text: Option<&str>,
        rollback: impl FnOnce(T, Option<&Error>) -> Result<()> + 's,
    ) -> Self {
        assert!(
            self.finally.is_none(),
            "final action must only be present with no commit and rollback"
        );
        self.rollback = Some((message(text), Box::new(rollback)));
        self
    }

    pub fn finally(
        mut self,
        text: Option<&str>,
        finally: impl FnOnce(T, Option<&Error>) -> Result<()> + 's,
    ) -> Self {
        assert!(
            self.commit.is_none() && self.rollback.is_none(),
            "final action must only be present with no commit and rollback"
        );
        self.finally = Some((message(text), Box::new(finally)));
        self
    }

    /// Run `body` inside the transaction.
    pub fn run<R>(self, body: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let Transaction {
            prepare: (prepare_text, prepare),
            commit,
            rollback,
            finally,
        } = self;

        if let Some(text) = &prepare_text {
            info!("{text}");
        }
        let mut value = prepare()?;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut value)));
        match outcome {
            Ok(Ok(result)) => {
                if let Some((text, finish)) = finally {
                    if let Some(text) = &text {
                        info!("{text}");
                    }
                    if let Err(err) = finish(value, None) {
                        error!(
                            "Exception while {}: {err}",
                            text.as_deref().unwrap_or("finalizing")
                        );
                    }
                } else if let Some((text, finish)) = commit {
                    if let Some(text) = &text {
                        info!("{text}");
                    }
                    if let Err(err) = finish(value) {
                        error!(
                            "Exception while {}: {err}",
                            text.as_deref().unwrap_or("committing")
                        );
                    }
                }
                Ok(result)
            }
            Ok(Err(err)) => {
                undo(finally.or(rollback), value, Some(&err));
                Err(err)
            }
            Err(panic_payload) => {
                undo(finally.or(rollback), value, None);
                panic::resume_unwind(panic_payload);
            }
        }
    }
}

fn undo<T>(finisher: Option<(Option<String>, Rollback<'_, T>)>, value: T, err: Option<&Error>) {
    if let Some((text, finish)) = finisher {
        if let Some(text) = &text {
            warn!("{text}");
        }
        if let Err(rollback_err) = finish(value, err) {
            error!(
                "Exception while {}: {rollback_err}",
                text.as_deref().unwrap_or("rolling back")
            );
        }
    }
}

/// When a pushed compensation runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum When {
    Always,
    OnFailure,
    OnSuccess,
}

type Action<'s> = Box<dyn FnOnce() -> Result<()> + 's>;

/// A stack of compensating actions.
///
/// Actions are pushed as resources are acquired and run in reverse order
/// when the scope closes; errors inside compensations are logged, never
/// propagated.
pub struct Scope<'s> {
    cleanups: Vec<(String, When, Action<'s>)>,
}

impl<'s> Scope<'s> {
    pub fn new() -> Self {
        Scope {
            cleanups: Vec::new(),
        }
    }

    pub fn always(&mut self, text: impl Into<String>, action: impl FnOnce() -> Result<()> + 's) {
        self.cleanups
            .push((text.into(), When::Always, Box::new(action)));
    }

    pub fn on_failure(
        &mut self,
        text: impl Into<String>,
        action: impl FnOnce() -> Result<()> + 's,
    ) {
        self.cleanups
            .push((text.into(), When::OnFailure, Box::new(action)));
    }

    pub fn on_success(
        &mut self,
        text: impl Into<String>,
        action: impl FnOnce() -> Result<()> + 's,
    ) {
        self.cleanups
            .push((text.into(), When::OnSuccess, Box::new(action)));
    }

    fn unwind(&mut self, failed: bool) {
        while let Some((text, when, action)) = self.cleanups.pop() {
            let due = match when {
                When::Always => true,
                When::OnFailure => failed,
                When::OnSuccess => !failed,
            };
            if !due {
                continue;
            }
            if failed {
                warn!("{text}");
            } else {
                info!("{text}");
            }
            if let Err(err) = action() {
                error!("Exception while {text}: {err}");
            }
        }
    }
}

impl<'s> Default for Scope<'s> {
    fn default() -> Self {
        Scope::new()
    }
}

/// Run `body` with a compensation scope, unwinding on every exit path.
pub fn with_scope<'s, R>(body: impl FnOnce(&mut Scope<'s>) -> Result<R>) -> Result<R> {
    let mut scope = Scope::new();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&mut scope)));
    match outcome {
        Ok(Ok(result)) => {
            scope.unwind(false);
            Ok(result)
        }
        Ok(Err(err)) => {
            scope.unwind(true);
            Err(err)
        }
        Err(panic_payload) => {
            scope.unwind(true);
            panic::resume_unwind(panic_payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn commit_runs_once_on_success() {
        let committed = Rc::new(RefCell::new(0));
        let rolled_back = Rc::new(RefCell::new(0));
        let c = committed.clone();
        let r = rolled_back.clone();
        let result = Transaction::prepare(None, || Ok(7))
            .commit(None, move |value| {
                // The finisher sees the value as the body left it.
                assert_eq!(value, 8);
                *c.borrow_mut() += 1;
                Ok(())
            })
            .rollback(None, move |_, _| {
                *r.borrow_mut() += 1;
                Ok(())
            })
            .run(|value| {
                *value += 1;
                Ok(*value)
            });
        assert_eq!(result.unwrap(), 8);
        assert_eq!(*committed.borrow(), 1);
        assert_eq!(*rolled_back.borrow(), 0);
    }

    #[test]
    fn rollback_runs_on_failure_and_error_is_preserved() {
        let rolled_back = Rc::new(RefCell::new(false));
        let r = rolled_back.clone();
        let result: Result<()> = Transaction::prepare(None, || Ok("lv".to_string()))
            .rollback(None, move |value, err| {
                assert_eq!(value, "lv");
                assert!(err.is_some());
                *r.borrow_mut() = true;
                Err(Error::host("rollback broke too"))
            })
            .run(|_| Err(Error::host("body failed")));
        // The rollback error is logged, the body error wins.
        assert_eq!(result.unwrap_err().to_string(), "body failed");
        assert!(*rolled_back.borrow());
    }

    #[test]
    fn finally_runs_on_both_paths() {
        let runs = Rc::new(RefCell::new(0));
        let r1 = runs.clone();
        let ok: Result<()> = Transaction::new()
            .finally(None, move |_, err| {
                assert!(err.is_none());
                *r1.borrow_mut() += 1;
                Ok(())
            })
            .run(|_| Ok(()));
        assert!(ok.is_ok());

        let r2 = runs.clone();
        let failed: Result<()> = Transaction::new()
            .finally(None, move |_, err| {
                assert!(err.is_some());
                *r2.borrow_mut() += 1;
                Ok(())
            })
            .run(|_| Err(Error::host("nope")));
        assert!(failed.is_err());
        assert_eq!(*runs.borrow(), 2);
    }

    #[test]
    #[should_panic(expected = "final action must only be present")]
    fn finally_is_exclusive_with_commit() {
        let _ = Transaction::prepare(None, || Ok(()))
            .commit(None, |_| Ok(()))
            .finally(None, |_, _| Ok(()));
    }

    #[test]
    fn prepare_failure_skips_every_finisher() {
        let touched = Rc::new(RefCell::new(false));
        let t = touched.clone();
        let result: Result<()> = Transaction::prepare(None, || Err(Error::host("prepare failed")))
            .finally(None, move |_: (), _| {
                *t.borrow_mut() = true;
                Ok(())
            })
            .run(|_| Ok(()));
        assert!(result.is_err());
        assert!(!*touched.borrow());
    }

    #[test]
    fn rollback_fires_under_panic() {
        let rolled_back = Rc::new(RefCell::new(false));
        let r = rolled_back.clone();
        let tx = Transaction::prepare(None, || Ok(()))
            .rollback(None, move |_, err| {
                assert!(err.is_none());
                *r.borrow_mut() = true;
                Ok(())
            });
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let _: Result<()> = tx.run(|_| panic!("interrupted"));
        }));
        assert!(outcome.is_err());
        assert!(*rolled_back.borrow());
    }

    #[test]
    fn scope_unwinds_in_reverse_order() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let (o1, o2, o3) = (order.clone(), order.clone(), order.clone());
        let result: Result<()> = with_scope(|scope| {
            scope.always("first", move || {
                o1.borrow_mut().push(1);
                Ok(())
            });
            scope.on_failure("second", move || {
                o2.borrow_mut().push(2);
                Ok(())
            });
            scope.always("third", move || {
                o3.borrow_mut().push(3);
                Ok(())
            });
            Err(Error::host("boom"))
        });
        assert!(result.is_err());
        assert_eq!(*order.borrow(), vec![3, 2, 1]);
    }

    #[test]
    fn scope_skips_failure_actions_on_success() {
        let order = Rc::new(RefCell::new(Vec::new()));
        let (o1, o2, o3) = (order.clone(), order.clone(), order.clone());
        let result: Result<()> = with_scope(|scope| {
            scope.on_failure("failure-only", move || {
                o1.borrow_mut().push(1);
                Ok(())
            });
            scope.on_success("success-only", move || {
                o2.borrow_mut().push(2);
                Ok(())
            });
            scope.always("always", move || {
                o3.borrow_mut().push(3);
                Ok(())
            });
            Ok(())
        });
        assert!(result.is_ok());
        assert_eq!(*order.borrow(), vec![3, 2]);
    }
}
