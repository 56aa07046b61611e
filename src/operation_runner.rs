use crate::operation::OperationEvent;
use crate::targets::Target;

/// Run `run_target` on each selected target in order.
///
/// A single target's error is returned as is. With several targets every one
/// is attempted and failures are folded into `make_multi_failed(failed, total)`.
pub(crate) fn run_targets<F, E, RunTarget, MakeMultiFailed>(
    selected: Vec<Target>,
    mut run_target: RunTarget,
    make_multi_failed: MakeMultiFailed,
    on_event: &mut F,
) -> Result<(), E>
where
    F: FnMut(OperationEvent),
    E: std::fmt::Display,
    RunTarget: FnMut(&Target, &str, &mut F) -> Result<(), E>,
    MakeMultiFailed: Fn(usize, usize) -> E,
{
    let total = selected.len();
    let multi = total > 1;

    let mut failed = 0usize;
    for target in selected {
        let target_id = target.id();
        on_event(OperationEvent::TargetStart {
            target_id: target_id.clone(),
        });

        match run_target(&target, &target_id, on_event) {
            Ok(()) => {
                on_event(OperationEvent::TargetDone {
                    target_id,
                    ok: true,
                    message: None,
                });
            }
            Err(e) => {
                failed += 1;
                tracing::warn!(target = %target_id, error = %e, "target failed");
                on_event(OperationEvent::TargetDone {
                    target_id,
                    ok: false,
                    message: Some(e.to_string()),
                });

                if !multi {
                    return Err(e);
                }
            }
        }
    }

    if failed > 0 {
        Err(make_multi_failed(failed, total))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_target_failures_are_aggregated() {
        let selected = vec![
            Target::from_port_name("A"),
            Target::from_port_name("B"),
            Target::from_port_name("C"),
        ];
        let mut events = Vec::new();
        let mut visited = Vec::new();

        let r: Result<(), String> = run_targets(
            selected,
            |t, _, _| {
                visited.push(t.port_name.clone());
                if t.port_name == "B" {
                    Err("boom".to_string())
                } else {
                    Ok(())
                }
            },
            |failed, total| format!("{failed}/{total}"),
            &mut |e| events.push(e),
        );

        assert_eq!(r.unwrap_err(), "1/3");
        assert_eq!(visited, vec!["A", "B", "C"]);
        let done: Vec<bool> = events
            .iter()
            .filter_map(|e| match e {
                OperationEvent::TargetDone { ok, .. } => Some(*ok),
                _ => None,
            })
            .collect();
        assert_eq!(done, vec![true, false, true]);
    }

    #[test]
    fn single_target_error_is_returned_unchanged() {
        let r: Result<(), String> = run_targets(
            vec![Target::from_port_name("A")],
            |_, _, _| Err("no ack".to_string()),
            |_, _| "multi".to_string(),
            &mut |_| {},
        );
        assert_eq!(r.unwrap_err(), "no ack");
    }
}
