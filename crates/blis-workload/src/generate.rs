//! Workload generation: spec in, concrete request list out.
//!
//! Request ids are dense and minted in arrival order after all clients
//! are drafted, so the id sequence is a property of the workload, not
//! of client iteration order.

use rand::Rng;
use rand_chacha::ChaCha8Rng;

use blis_core::{Micros, Request, RngPartition, SessionId, TokenId};

use crate::sampler::{ArrivalSampler, LengthSampler};
use crate::spec::{ClientSpec, WorkloadError, WorkloadSpec};
use crate::VOCAB_SIZE;

struct Draft {
    arrival: Micros,
    client: usize,
    seq: u64,
    tokens: Vec<TokenId>,
    output: u32,
    session: Option<SessionId>,
}

fn sample_tokens(rng: &mut ChaCha8Rng, len: u32) -> Vec<TokenId> {
    (0..len).map(|_| rng.gen_range(0..VOCAB_SIZE)).collect()
}

fn exp_gap(rng: &mut ChaCha8Rng, mean_micros: u64) -> Micros {
    let u: f64 = loop {
        let u: f64 = rng.gen();
        if u > 0.0 {
            break u;
        }
    };
    (-u.ln() * mean_micros as f64).round() as Micros
}

/// Split `num_requests` across clients proportionally to rate
/// fraction: floor shares first, remainder to the earliest clients.
fn request_counts(spec: &WorkloadSpec, total_fraction: f64) -> Vec<u64> {
    let mut counts: Vec<u64> = spec
        .clients
        .iter()
        .map(|c| {
            ((c.rate_fraction / total_fraction) * spec.num_requests as f64).floor() as u64
        })
        .collect();
    let assigned: u64 = counts.iter().sum();
    let mut remainder = spec.num_requests - assigned;
    for count in counts.iter_mut() {
        if remainder == 0 {
            break;
        }
        *count += 1;
        remainder -= 1;
    }
    counts
}

fn draft_client(
    ci: usize,
    client: &ClientSpec,
    n: u64,
    rate: f64,
    rng: &RngPartition,
    drafts: &mut Vec<Draft>,
) {
    let mut arrivals = ArrivalSampler::new(
        client.arrival.clone(),
        rate,
        rng.labeled(&format!("arrivals/client/{ci}")),
    );
    let mut input_len = LengthSampler::new(
        client.input_tokens.clone(),
        rng.labeled(&format!("input-lengths/client/{ci}")),
    );
    let mut output_len = LengthSampler::new(
        client.output_tokens.clone(),
        rng.labeled(&format!("output-lengths/client/{ci}")),
    );
    let mut content = rng.labeled(&format!("tokens/client/{ci}"));
    let mut jitter = rng.labeled(&format!("jitter/client/{ci}"));
    // Group prefixes derive from the group id alone, so every client
    // in a group shares the exact same tokens.
    let prefix: Vec<TokenId> = client
        .prefix_group
        .as_ref()
        .map(|g| sample_tokens(&mut rng.labeled(&format!("prefix-group/{}", g.id)), g.tokens))
        .unwrap_or_default();

    match &client.multi_turn {
        None => {
            let mut t: Micros = 0;
            for seq in 0..n {
                t += arrivals.next_gap_micros();
                let mut tokens = prefix.clone();
                tokens.extend(sample_tokens(&mut content, input_len.next_len()));
                drafts.push(Draft {
                    arrival: t,
                    client: ci,
                    seq,
                    tokens,
                    output: output_len.next_len(),
                    session: None,
                });
            }
        }
        Some(mt) => {
            let mut produced = 0u64;
            let mut session_idx = 0u64;
            let mut session_start: Micros = 0;
            while produced < n {
                session_start += arrivals.next_gap_micros();
                let session_id: SessionId = ((ci as u64) << 32) | session_idx;
                // The conversation so far; grows with every turn.
                let mut context = prefix.clone();
                let mut turn_time = session_start;
                for turn in 0..mt.turns {
                    if produced >= n {
                        break;
                    }
                    if turn > 0 {
                        turn_time += exp_gap(&mut jitter, mt.think_time_micros);
                    }
                    let out_len = output_len.next_len();
                    let mut tokens = context.clone();
                    tokens.extend(sample_tokens(&mut content, input_len.next_len()));
                    // Next turn sees this turn's input plus its reply.
                    context = tokens.clone();
                    context.extend(sample_tokens(&mut content, out_len));
                    drafts.push(Draft {
                        arrival: turn_time,
                        client: ci,
                        seq: produced,
                        tokens,
                        output: out_len,
                        session: Some(session_id),
                    });
                    produced += 1;
                }
                session_idx += 1;
            }
        }
    }
}

/// Generate the full request list for a workload.
pub fn generate(spec: &WorkloadSpec, rng: &RngPartition) -> Result<Vec<Request>, WorkloadError> {
    spec.validate()?;
    let total_fraction: f64 = spec.clients.iter().map(|c| c.rate_fraction).sum();
    let counts = request_counts(spec, total_fraction);

    let mut drafts: Vec<Draft> = Vec::with_capacity(spec.num_requests as usize);
    for (ci, client) in spec.clients.iter().enumerate() {
        if counts[ci] == 0 {
            continue;
        }
        let rate = spec.rate_per_sec * client.rate_fraction / total_fraction;
        draft_client(ci, client, counts[ci], rate, rng, &mut drafts);
    }

    // Ids follow arrival order; client index and per-client sequence
    // break simultaneous arrivals deterministically.
    drafts.sort_by_key(|d| (d.arrival, d.client, d.seq));
    let requests = drafts
        .into_iter()
        .enumerate()
        .map(|(id, d)| {
            let client = &spec.clients[d.client];
            let tenant = client.tenant.clone().unwrap_or_else(|| client.name.clone());
            Request::new(
                id as u64,
                d.arrival,
                d.tokens,
                d.output,
                client.slo,
                tenant,
                d.session,
            )
        })
        .collect();
    tracing::debug!(
        requests = spec.num_requests,
        clients = spec.clients.len(),
        "workload generated"
    );
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ArrivalSpec, LengthSpec, MultiTurnSpec, PrefixGroupSpec};
    use blis_core::SloClass;

    fn client(name: &str, fraction: f64) -> ClientSpec {
        ClientSpec {
            name: name.into(),
            rate_fraction: fraction,
            arrival: ArrivalSpec::Poisson,
            input_tokens: LengthSpec::Gaussian {
                mean: 64.0,
                std: 8.0,
            },
            output_tokens: LengthSpec::Gaussian {
                mean: 16.0,
                std: 4.0,
            },
            slo: SloClass::Standard,
            tenant: None,
            prefix_group: None,
            multi_turn: None,
        }
    }

    fn spec(clients: Vec<ClientSpec>, n: u64) -> WorkloadSpec {
        WorkloadSpec {
            num_requests: n,
            rate_per_sec: 100.0,
            clients,
        }
    }

    #[test]
    fn generates_exactly_num_requests_with_dense_ids() {
        let s = spec(vec![client("a", 2.0), client("b", 1.0)], 31);
        let reqs = generate(&s, &RngPartition::new(42)).unwrap();
        assert_eq!(reqs.len(), 31);
        for (i, r) in reqs.iter().enumerate() {
            assert_eq!(r.id(), i as u64);
        }
        // Ids are arrival-ordered.
        for pair in reqs.windows(2) {
            assert!(pair[0].arrival() <= pair[1].arrival());
        }
    }

    #[test]
    fn request_split_follows_fractions() {
        let s = spec(vec![client("a", 3.0), client("b", 1.0)], 100);
        let reqs = generate(&s, &RngPartition::new(42)).unwrap();
        let a = reqs.iter().filter(|r| r.tenant() == "a").count();
        let b = reqs.iter().filter(|r| r.tenant() == "b").count();
        assert_eq!(a, 75);
        assert_eq!(b, 25);
    }

    #[test]
    fn same_seed_same_workload() {
        let s = spec(vec![client("a", 1.0), client("b", 1.0)], 50);
        let x = generate(&s, &RngPartition::new(7)).unwrap();
        let y = generate(&s, &RngPartition::new(7)).unwrap();
        assert_eq!(x.len(), y.len());
        for (a, b) in x.iter().zip(&y) {
            assert_eq!(a.arrival(), b.arrival());
            assert_eq!(a.input_tokens(), b.input_tokens());
            assert_eq!(a.expected_output(), b.expected_output());
        }
        let z = generate(&s, &RngPartition::new(8)).unwrap();
        assert!(x.iter().zip(&z).any(|(a, b)| a.arrival() != b.arrival()));
    }

    #[test]
    fn adding_a_client_does_not_shift_existing_streams() {
        let one = spec(vec![client("a", 1.0)], 10);
        let two = spec(vec![client("a", 1.0), client("b", 1.0)], 20);
        let x = generate(&one, &RngPartition::new(42)).unwrap();
        let y = generate(&two, &RngPartition::new(42)).unwrap();
        // Client a's gap sequence is untouched by client b's existence
        // (its absolute arrivals differ only through its own count).
        let gaps = |reqs: &[Request], tenant: &str| -> Vec<u64> {
            let arrivals: Vec<u64> = reqs
                .iter()
                .filter(|r| r.tenant() == tenant)
                .map(|r| r.arrival())
                .collect();
            arrivals.windows(2).map(|w| w[1] - w[0]).collect()
        };
        let gx = gaps(&x, "a");
        let gy = gaps(&y, "a");
        assert_eq!(gx[..], gy[..gx.len()]);
    }

    #[test]
    fn prefix_groups_share_exact_tokens_across_clients() {
        let mut a = client("a", 1.0);
        let mut b = client("b", 1.0);
        let group = PrefixGroupSpec {
            id: "sys".into(),
            tokens: 32,
        };
        a.prefix_group = Some(group.clone());
        b.prefix_group = Some(group);
        let reqs = generate(&spec(vec![a, b], 10), &RngPartition::new(42)).unwrap();
        let first = &reqs[0].input_tokens()[..32];
        for r in &reqs {
            assert_eq!(&r.input_tokens()[..32], first);
        }
    }

    #[test]
    fn multi_turn_accumulates_context() {
        let mut c = client("chat", 1.0);
        c.multi_turn = Some(MultiTurnSpec {
            turns: 3,
            think_time_micros: 1_000,
        });
        let reqs = generate(&spec(vec![c], 9), &RngPartition::new(42)).unwrap();
        // Group by session.
        let mut by_session: std::collections::BTreeMap<u64, Vec<&Request>> =
            std::collections::BTreeMap::new();
        for r in &reqs {
            by_session.entry(r.session().unwrap()).or_default().push(r);
        }
        assert_eq!(by_session.len(), 3);
        for turns in by_session.values() {
            let mut turns = turns.clone();
            turns.sort_by_key(|r| r.arrival());
            for pair in turns.windows(2) {
                let prev = pair[0].input_tokens();
                let next = pair[1].input_tokens();
                // Later turns start with the entire earlier turn input.
                assert!(next.len() > prev.len());
                assert_eq!(&next[..prev.len()], prev);
                assert!(pair[1].arrival() >= pair[0].arrival());
            }
        }
    }
}
