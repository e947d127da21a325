//! End-to-end strategy runs on a 4-stage × 3-choice supernet with a cost
//! table where choice `c` costs `c + 1` at every stage.

use candle_core::{Device, Tensor};

use supernet_common::{
    Activation, BlockSpec, EvalMetrics, EvolutionConfig, InfoMetric, LayerConfig, MacroConfig,
    MicroConfig, NasError, Result, SearchSpaceConfig, StageConfig,
};
use supernet_core::{
    Architecture, ArchitectureParameter, ForwardState, LookupTable, Supernet, UniformSampler,
};
use supernet_search::{
    CostConstraint, DifferentiableSearch, EvaluationObjective, EvolutionSearch, RandomSearch,
    SearchContext, SearchStrategy,
};

fn tiny_space() -> SearchSpaceConfig {
    SearchSpaceConfig {
        input_channels: 1,
        input_size: 4,
        classes: 3,
        macro_config: MacroConfig {
            first: vec![LayerConfig {
                in_channels: 1,
                out_channels: 4,
                stride: 1,
                block: BlockSpec::conv(3, Activation::Relu),
            }],
            search: vec![StageConfig { in_channels: 4, out_channels: 4, stride: 1 }; 4],
            last: vec![],
        },
        micro_config: MicroConfig(vec![
            BlockSpec::conv(3, Activation::Relu),
            BlockSpec::mobile(3, 2, Activation::Relu6, false),
            BlockSpec::skip(),
        ]),
    }
}

fn table() -> LookupTable {
    LookupTable::from_fn(4, 3, InfoMetric::Flops, |_, c| (c + 1) as f64)
}

/// Scores an architecture by the sum of its choices, ignoring the weights.
#[derive(Default)]
struct ChoiceSumObjective {
    seen: Vec<Architecture>,
}

impl EvaluationObjective for ChoiceSumObjective {
    fn evaluate(&mut self, supernet: &Supernet) -> Result<EvalMetrics> {
        assert_eq!(supernet.forward_state(), ForwardState::Single);
        let arch = supernet
            .active_architecture()
            .cloned()
            .ok_or_else(|| NasError::state("no active architecture"))?;
        let score = arch.iter().sum::<usize>() as f64 / 8.0;
        self.seen.push(arch);
        Ok(EvalMetrics {
            top1: score,
            top5: 1.0,
            loss: 1.0 - score,
        })
    }
}

#[test]
fn random_search_returns_best_feasible_candidate() {
    let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
    let mut sampler = UniformSampler::for_supernet(&net, Some(42));
    let table = table();
    let mut objective = ChoiceSumObjective::default();

    let outcome = {
        let mut ctx = SearchContext {
            supernet: &mut net,
            training_strategy: &mut sampler,
            lookup_table: &table,
            objective: &mut objective,
        };
        let constraint = CostConstraint::new(InfoMetric::Flops, 6.0, 10_000);
        RandomSearch::new(constraint, 50).search(&mut ctx).unwrap()
    };

    assert_eq!(outcome.evaluations, 50);
    assert_eq!(objective.seen.len(), 50);
    assert!(outcome.cost <= 6.0);
    assert_eq!(table.get_cost(&outcome.architecture, InfoMetric::Flops).unwrap(), outcome.cost);

    for arch in &objective.seen {
        assert!(table.get_cost(arch, InfoMetric::Flops).unwrap() <= 6.0);
    }
    let best = objective
        .seen
        .iter()
        .map(|a| a.iter().sum::<usize>() as f64 / 8.0)
        .fold(f64::MIN, f64::max);
    assert_eq!(outcome.top1, best);
    // Ties resolve to the first candidate with the best score.
    let first_best = objective
        .seen
        .iter()
        .find(|a| a.iter().sum::<usize>() as f64 / 8.0 == best)
        .unwrap();
    assert_eq!(&outcome.architecture, first_best);
    assert_eq!(net.active_architecture(), Some(first_best));
}

#[test]
fn random_search_with_unreachable_budget_is_infeasible() {
    let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
    let mut sampler = UniformSampler::for_supernet(&net, Some(0));
    let table = table();
    let mut objective = ChoiceSumObjective::default();
    let mut ctx = SearchContext {
        supernet: &mut net,
        training_strategy: &mut sampler,
        lookup_table: &table,
        objective: &mut objective,
    };
    let constraint = CostConstraint::new(InfoMetric::Flops, 3.0, 100);
    let err = RandomSearch::new(constraint, 50).search(&mut ctx).unwrap_err();
    assert!(matches!(err, NasError::Infeasible { .. }));
    assert!(objective.seen.is_empty());
}

#[test]
fn evolution_search_stays_within_budget() {
    let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
    let mut sampler = UniformSampler::for_supernet(&net, Some(9));
    let table = table();
    let mut objective = ChoiceSumObjective::default();
    let config = EvolutionConfig {
        population_size: 6,
        generations: 3,
        parent_size: 2,
        mutation_size: 3,
        crossover_size: 3,
        mutation_prob: 0.5,
    };

    let outcome = {
        let mut ctx = SearchContext {
            supernet: &mut net,
            training_strategy: &mut sampler,
            lookup_table: &table,
            objective: &mut objective,
        };
        let constraint = CostConstraint::new(InfoMetric::Flops, 7.0, 200);
        EvolutionSearch::new(constraint, config, Some(3)).search(&mut ctx).unwrap()
    };

    assert_eq!(outcome.evaluations, objective.seen.len());
    assert!(outcome.evaluations >= 6);
    for arch in &objective.seen {
        assert!(table.get_cost(arch, InfoMetric::Flops).unwrap() <= 7.0);
    }
    let best = objective
        .seen
        .iter()
        .map(|a| a.iter().sum::<usize>() as f64 / 8.0)
        .fold(f64::MIN, f64::max);
    assert_eq!(outcome.top1, best);
}

#[test]
fn differentiable_search_gates_argmax_on_budget() {
    let table = table();
    let mut net = Supernet::new(&tiny_space(), &Device::Cpu).unwrap();
    let logits = Tensor::new(
        &[[0f32, 1.0, 0.0], [2.0, 0.0, 0.0], [0.0, 0.0, 0.0], [0.0, 0.5, 0.0]],
        &Device::Cpu,
    )
    .unwrap();
    net.set_architecture_parameter(ArchitectureParameter::from_tensor(&logits).unwrap())
        .unwrap();
    let mut sampler = UniformSampler::for_supernet(&net, Some(1));
    let mut objective = ChoiceSumObjective::default();

    let mut ctx = SearchContext {
        supernet: &mut net,
        training_strategy: &mut sampler,
        lookup_table: &table,
        objective: &mut objective,
    };
    // argmax = [1, 0, 0, 1], cost 6.
    let outcome = DifferentiableSearch::new(CostConstraint::new(InfoMetric::Flops, 6.0, 1))
        .search(&mut ctx)
        .unwrap();
    assert_eq!(outcome.architecture.as_slice(), &[1, 0, 0, 1]);
    assert_eq!(outcome.cost, 6.0);
    assert_eq!(outcome.evaluations, 1);

    let err = DifferentiableSearch::new(CostConstraint::new(InfoMetric::Flops, 5.0, 1))
        .search(&mut ctx)
        .unwrap_err();
    assert!(matches!(err, NasError::Infeasible { .. }));
}
