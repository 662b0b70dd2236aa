//! Named workload presets.
//!
//! A preset expands to a full [`WorkloadSpec`]; everything downstream
//! treats it exactly like a hand-written spec. The registry is closed
//! and validated like the policy registries.

use blis_core::SloClass;

use crate::spec::{
    ArrivalSpec, ClientSpec, LengthSpec, MultiTurnSpec, PrefixGroupSpec, WorkloadError,
    WorkloadSpec,
};

pub const PRESET_NAMES: &[&str] = &["steady", "bursty", "heavy-tail", "chat"];

fn gaussian(mean: f64) -> LengthSpec {
    LengthSpec::Gaussian {
        mean,
        std: mean / 4.0,
    }
}

fn base_client(name: &str, arrival: ArrivalSpec, mean_input: f64, mean_output: f64) -> ClientSpec {
    ClientSpec {
        name: name.into(),
        rate_fraction: 1.0,
        arrival,
        input_tokens: gaussian(mean_input),
        output_tokens: gaussian(mean_output),
        slo: SloClass::Standard,
        tenant: None,
        prefix_group: None,
        multi_turn: None,
    }
}

/// Expand a preset by name.
pub fn build_preset(
    name: &str,
    rate_per_sec: f64,
    num_requests: u64,
    mean_input: f64,
    mean_output: f64,
) -> Result<WorkloadSpec, WorkloadError> {
    let clients = match name {
        "steady" => vec![base_client(
            "steady",
            ArrivalSpec::Poisson,
            mean_input,
            mean_output,
        )],
        "bursty" => vec![base_client(
            "bursty",
            ArrivalSpec::Gamma { shape: 0.3 },
            mean_input,
            mean_output,
        )],
        "heavy-tail" => {
            let mut c = base_client(
                "heavy-tail",
                ArrivalSpec::Weibull { shape: 0.5 },
                mean_input,
                mean_output,
            );
            // Log-normal body centered on the requested mean output
            // with a Pareto tail for the occasional very long reply.
            c.output_tokens = LengthSpec::ParetoLognormal {
                mu: mean_output.ln(),
                sigma: 0.6,
                alpha: 1.5,
                tail_weight: 0.05,
            };
            vec![c]
        }
        "chat" => {
            let mut c = base_client("chat", ArrivalSpec::Poisson, mean_input, mean_output);
            c.prefix_group = Some(PrefixGroupSpec {
                id: "chat-system-prompt".into(),
                tokens: 64,
            });
            c.multi_turn = Some(MultiTurnSpec {
                turns: 4,
                think_time_micros: 2_000_000,
            });
            vec![c]
        }
        other => {
            return Err(WorkloadError::UnknownPreset(
                other.to_string(),
                PRESET_NAMES.join(", "),
            ))
        }
    };
    let spec = WorkloadSpec {
        num_requests,
        rate_per_sec,
        clients,
    };
    spec.validate()?;
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate;
    use blis_core::RngPartition;

    #[test]
    fn every_preset_generates() {
        for name in PRESET_NAMES {
            let spec = build_preset(name, 50.0, 40, 256.0, 64.0).unwrap();
            let reqs = generate(&spec, &RngPartition::new(42)).unwrap();
            assert_eq!(reqs.len(), 40, "preset {name}");
        }
    }

    #[test]
    fn chat_preset_shares_prefixes() {
        let spec = build_preset("chat", 50.0, 8, 128.0, 32.0).unwrap();
        let reqs = generate(&spec, &RngPartition::new(42)).unwrap();
        let first = &reqs[0].input_tokens()[..64];
        for r in &reqs {
            assert_eq!(&r.input_tokens()[..64], first);
            assert!(r.session().is_some());
        }
    }

    #[test]
    fn unknown_preset_is_rejected() {
        assert!(matches!(
            build_preset("surprise", 1.0, 1, 64.0, 16.0),
            Err(WorkloadError::UnknownPreset(_, _))
        ));
    }

    #[test]
    fn bad_parameters_fail_validation() {
        assert!(build_preset("steady", 0.0, 10, 64.0, 16.0).is_err());
        assert!(build_preset("steady", 1.0, 0, 64.0, 16.0).is_err());
    }
}
