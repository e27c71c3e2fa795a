use anyhow::anyhow;

pub const DEFAULT_MAX_PASSES: usize = 3;

#[derive(Clone, Debug)]
pub struct RetryOutcome<T> {
    pub output: T,
    /// False when the pass budget ran out with residue still present. The
    /// caller records the unresolved state; a degraded artifact beats none.
    pub verified: bool,
    pub passes: usize,
}

/// Run `produce` up to `max_passes` times, feeding each pass's output back in
/// for incremental refinement, until `has_residue` reports clean. A pass-1
/// production failure is fatal; a later empty production keeps the previous
/// pass's output.
pub fn retry_until_verified<T, P, V>(
    seed: &T,
    max_passes: usize,
    mut produce: P,
    mut has_residue: V,
) -> anyhow::Result<RetryOutcome<T>>
where
    P: FnMut(&T) -> anyhow::Result<Option<T>>,
    V: FnMut(&T) -> bool,
{
    if max_passes == 0 {
        return Err(anyhow!("max_passes_must_be_positive"));
    }

    let mut current = match produce(seed)? {
        Some(out) => out,
        None => return Err(anyhow!("produce_failed")),
    };
    let mut passes = 1usize;

    loop {
        if !has_residue(&current) {
            return Ok(RetryOutcome {
                output: current,
                verified: true,
                passes,
            });
        }
        if passes >= max_passes {
            return Ok(RetryOutcome {
                output: current,
                verified: false,
                passes,
            });
        }
        match produce(&current)? {
            Some(next) => {
                current = next;
                passes += 1;
            }
            None => {
                return Ok(RetryOutcome {
                    output: current,
                    verified: false,
                    passes,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_first_pass_stops_after_one_call() {
        let mut calls = 0usize;
        let outcome = retry_until_verified(
            &"fig".to_string(),
            DEFAULT_MAX_PASSES,
            |input| {
                calls += 1;
                Ok(Some(format!("{input}+redraw")))
            },
            |_| false,
        )
        .expect("outcome");
        assert_eq!(calls, 1);
        assert!(outcome.verified);
        assert_eq!(outcome.passes, 1);
        assert_eq!(outcome.output, "fig+redraw");
    }

    #[test]
    fn exhausted_budget_returns_last_output_unverified() {
        let mut calls = 0usize;
        let outcome = retry_until_verified(
            &"fig".to_string(),
            3,
            |input| {
                calls += 1;
                Ok(Some(format!("{input}+p{calls}")))
            },
            |_| true,
        )
        .expect("outcome");
        assert_eq!(calls, 3);
        assert!(!outcome.verified);
        assert_eq!(outcome.passes, 3);
        assert_eq!(outcome.output, "fig+p1+p2+p3");
    }

    #[test]
    fn empty_first_production_is_fatal() {
        let err = retry_until_verified(
            &"fig".to_string(),
            3,
            |_| Ok(None::<String>),
            |_| true,
        )
        .expect_err("must fail");
        assert_eq!(err.to_string(), "produce_failed");
    }

    #[test]
    fn later_empty_production_keeps_previous_output() {
        let mut calls = 0usize;
        let outcome = retry_until_verified(
            &"fig".to_string(),
            3,
            |input| {
                calls += 1;
                if calls == 1 {
                    Ok(Some(format!("{input}+p1")))
                } else {
                    Ok(None)
                }
            },
            |_| true,
        )
        .expect("outcome");
        assert_eq!(calls, 2);
        assert!(!outcome.verified);
        assert_eq!(outcome.output, "fig+p1");
    }

    #[test]
    fn verification_stops_mid_budget() {
        let mut calls = 0usize;
        let outcome = retry_until_verified(
            &"fig".to_string(),
            5,
            |input| {
                calls += 1;
                Ok(Some(format!("{input}+p{calls}")))
            },
            |out| !out.ends_with("p2"),
        )
        .expect("outcome");
        assert_eq!(calls, 2);
        assert!(outcome.verified);
        assert_eq!(outcome.passes, 2);
    }
}
