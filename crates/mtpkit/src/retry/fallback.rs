//! The generic fallback ladder.
//!
//! A ladder is an ordered list of named rungs, each a progressively more
//! conservative way to accomplish the same operation. The engine runs rungs
//! in order, short-circuits on the first success, and records every attempt.
//! The ladder is the entire retry policy; call sites contribute rungs, not
//! control flow.

use std::time::Instant;

use futures_util::future::BoxFuture;
use log::{debug, warn};
use serde::Serialize;

use crate::error::Error;

/// A boxed rung body, borrowing the shared context for one attempt.
pub type RungFuture<'a, T> = BoxFuture<'a, Result<T, Error>>;

type RungFn<Ctx, T> = Box<dyn for<'a> FnMut(&'a mut Ctx) -> RungFuture<'a, T> + Send>;

/// What happened on one rung.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub name: String,
    pub succeeded: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// The winning rung plus the full attempt trail.
#[derive(Debug)]
pub struct LadderOutcome<T> {
    pub value: T,
    pub rung: &'static str,
    pub attempts: Vec<AttemptRecord>,
}

/// An ordered list of named fallback rungs over a shared context `Ctx`.
pub struct FallbackLadder<Ctx, T> {
    label: &'static str,
    rungs: Vec<(&'static str, RungFn<Ctx, T>)>,
}

impl<Ctx, T> FallbackLadder<Ctx, T> {
    pub fn new(label: &'static str) -> Self {
        Self { label, rungs: Vec::new() }
    }

    /// Appends a rung. Rungs run in insertion order.
    pub fn rung<F>(mut self, name: &'static str, f: F) -> Self
    where
        F: for<'a> FnMut(&'a mut Ctx) -> RungFuture<'a, T> + Send + 'static,
    {
        self.rungs.push((name, Box::new(f)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rungs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rungs.len()
    }

    /// Runs rungs in order until one succeeds. An empty ladder fails
    /// immediately; if every rung fails, the error carries the attempt
    /// trail.
    pub async fn run(self, ctx: &mut Ctx) -> Result<LadderOutcome<T>, Error> {
        if self.rungs.is_empty() {
            warn!("{}: empty fallback ladder", self.label);
            return Err(Error::FallbackExhausted { attempts: Vec::new() });
        }

        let mut attempts = Vec::with_capacity(self.rungs.len());
        for (name, mut body) in self.rungs {
            let started = Instant::now();
            let result = body(ctx).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            match result {
                Ok(value) => {
                    debug!("{}: rung '{name}' succeeded in {duration_ms}ms", self.label);
                    attempts.push(AttemptRecord {
                        name: name.to_string(),
                        succeeded: true,
                        error: None,
                        duration_ms,
                    });
                    return Ok(LadderOutcome { value, rung: name, attempts });
                }
                Err(e) => {
                    debug!("{}: rung '{name}' failed in {duration_ms}ms: {e}", self.label);
                    attempts.push(AttemptRecord {
                        name: name.to_string(),
                        succeeded: false,
                        error: Some(e.to_string()),
                        duration_ms,
                    });
                }
            }
        }

        warn!("{}: all {} rungs failed", self.label, attempts.len());
        Err(Error::FallbackExhausted { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let mut calls: Vec<&'static str> = Vec::new();
        let ladder: FallbackLadder<Vec<&'static str>, u32> = FallbackLadder::new("test")
            .rung("a", |calls| {
                async move {
                    calls.push("a");
                    Ok(1)
                }
                .boxed()
            })
            .rung("b", |calls| {
                async move {
                    calls.push("b");
                    Ok(2)
                }
                .boxed()
            });
        let outcome = ladder.run(&mut calls).await.unwrap();
        assert_eq!(outcome.value, 1);
        assert_eq!(outcome.rung, "a");
        assert_eq!(calls, vec!["a"]);
        assert_eq!(outcome.attempts.len(), 1);
        assert!(outcome.attempts[0].succeeded);
    }

    #[tokio::test]
    async fn test_falls_through_to_later_rung() {
        let mut ctx = ();
        let ladder: FallbackLadder<(), &'static str> = FallbackLadder::new("test")
            .rung("broken", |_| async { Err(Error::Busy) }.boxed())
            .rung("working", |_| async { Ok("fine") }.boxed());
        let outcome = ladder.run(&mut ctx).await.unwrap();
        assert_eq!(outcome.value, "fine");
        assert_eq!(outcome.rung, "working");
        assert_eq!(outcome.attempts.len(), 2);
        assert!(!outcome.attempts[0].succeeded);
        assert_eq!(outcome.attempts[0].error.as_deref(), Some("device busy"));
        assert!(outcome.attempts[1].succeeded);
    }

    #[tokio::test]
    async fn test_all_fail_reports_attempts() {
        let mut ctx = ();
        let ladder: FallbackLadder<(), ()> = FallbackLadder::new("test")
            .rung("one", |_| async { Err(Error::Timeout) }.boxed())
            .rung("two", |_| async { Err(Error::ObjectNotFound) }.boxed());
        match ladder.run(&mut ctx).await {
            Err(Error::FallbackExhausted { attempts }) => {
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].name, "one");
                assert_eq!(attempts[1].name, "two");
                assert!(attempts.iter().all(|a| !a.succeeded));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_ladder_is_immediate_error() {
        let mut ctx = ();
        let ladder: FallbackLadder<(), ()> = FallbackLadder::new("test");
        match ladder.run(&mut ctx).await {
            Err(Error::FallbackExhausted { attempts }) => assert!(attempts.is_empty()),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_description_lists_rungs_and_errors() {
        let mut ctx = ();
        let ladder: FallbackLadder<(), ()> =
            FallbackLadder::new("test").rung("propList5", |_| async { Err(Error::Busy) }.boxed());
        let err = ladder.run(&mut ctx).await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("propList5"));
        assert!(text.contains("device busy"));
    }
}
