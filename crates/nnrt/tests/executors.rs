mod common;

use std::collections::HashMap;

use anyhow::Result;
use nnrt::ir::{
    Activation, Graph, Model, ModelIndex, OpKind, OperandInfo, OperationIndex, Package, Shape,
    SubgraphIndex,
};
use nnrt::tensor::DType;
use nnrt::{compile, CompilerOptions, ExecutorKind, HostTensor, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Two branches off one input that meet again: `relu(x) + transpose(transpose(x))`, then
/// normalized and concatenated with the softmax of the sum.
fn diamond_graph() -> Graph {
    let mut graph = Graph::new();
    let x = graph.add_operand(OperandInfo::f32(&[3, 4]));
    let relu = graph.add_operand(OperandInfo::f32(&[3, 4]));
    let flipped = graph.add_operand(OperandInfo::f32(&[4, 3]));
    let restored = graph.add_operand(OperandInfo::f32(&[3, 4]));
    let sum = graph.add_operand(OperandInfo::f32(&[3, 4]));
    let normalized = graph.add_operand(OperandInfo::f32(&[3, 4]));
    let probs = graph.add_operand(OperandInfo::f32(&[3, 4]));
    let joined = graph.add_operand(OperandInfo::f32(&[3, 8]));
    graph.add_input(x);
    graph.add_op(OpKind::ElementwiseActivation(Activation::Relu), [x], [relu]);
    graph.add_op(OpKind::Transpose { perm: vec![1, 0] }, [x], [flipped]);
    graph.add_op(OpKind::Transpose { perm: vec![1, 0] }, [flipped], [restored]);
    graph.add_op(common::add(), [relu, restored], [sum]);
    graph.add_op(OpKind::L2Normalize, [sum], [normalized]);
    graph.add_op(OpKind::Softmax { beta: 0.5 }, [sum], [probs]);
    graph.add_op(
        OpKind::Concat {
            axis: 1,
            activation: Activation::None,
        },
        [normalized, probs],
        [joined],
    );
    graph.add_output(joined);
    graph.add_output(sum);
    graph
}

fn run(graph: Graph, executor: ExecutorKind, inputs: &[HostTensor]) -> Result<Vec<HostTensor>> {
    let options = CompilerOptions::default().with_executor(executor);
    Ok(compile(graph, &options)?.execute(inputs)?)
}

#[test]
fn dataflow_matches_linear_on_random_inputs() -> Result<()> {
    common::setup();
    let mut rng = StdRng::seed_from_u64(42);
    for _ in 0..4 {
        let values: Vec<f32> = (0..12).map(|_| rng.gen_range(-2.0f32..2.0)).collect();
        let inputs = [common::tensor(&[3, 4], values)];
        let linear = run(diamond_graph(), ExecutorKind::Linear, &inputs)?;
        let dataflow = run(diamond_graph(), ExecutorKind::Dataflow, &inputs)?;
        assert_eq!(linear, dataflow);
    }

    let (dense, _) = common::dense_graph();
    let inputs = [common::tensor(&[2, 3], vec![0.5, -1.0, 2.0, 1.5, 0.0, -0.5])];
    assert_eq!(
        run(dense.clone(), ExecutorKind::Linear, &inputs)?,
        run(dense, ExecutorKind::Dataflow, &inputs)?
    );
    Ok(())
}

/// Transposes and the softmax on `cpu-plain`, everything else on `cpu`.
fn two_backend_options(executor: ExecutorKind) -> CompilerOptions {
    CompilerOptions {
        executor,
        profiling_mode: executor == ExecutorKind::Dataflow,
        heterogeneous_scheduler: true,
        backend_list: vec!["cpu".to_string()],
        manual_scheduler: HashMap::from([
            ("Transpose".to_string(), "cpu-plain".to_string()),
            ("Softmax".to_string(), "cpu-plain".to_string()),
        ]),
        ..CompilerOptions::default()
    }
}

#[test]
fn dataflow_across_two_backends_matches_linear() -> Result<()> {
    common::setup();
    let values: Vec<f32> = (0..12).map(|v| (v as f32 - 5.5) / 3.0).collect();
    let inputs = [common::tensor(&[3, 4], values)];
    let linear = compile(diamond_graph(), &two_backend_options(ExecutorKind::Linear))?;
    let dataflow = compile(diamond_graph(), &two_backend_options(ExecutorKind::Dataflow))?;

    let lowered = dataflow.executors().entry().expect("entry executor").lowered();
    assert_eq!(lowered.backend_names(), vec!["cpu".to_string(), "cpu-plain".to_string()]);
    assert!(!lowered.transfers().is_empty());
    assert_eq!(linear.execute(&inputs)?, dataflow.execute(&inputs)?);

    // Every operation finished after all of its producers, on either backend.
    let events = dataflow.tracing().operation_events();
    assert_eq!(events.len(), lowered.indexed_ranks().len());
    let finished_at = |operation: OperationIndex| {
        events
            .iter()
            .position(|event| event.operation == operation)
            .expect("operation ran")
    };
    for index in lowered.indexed_ranks() {
        let operation = lowered.graph().operation(*index);
        for producer in lowered.graph().producers_of(operation) {
            assert!(finished_at(producer) < finished_at(*index));
        }
        assert_eq!(
            events[finished_at(*index)].backend,
            lowered.backend(*index).name()
        );
    }
    Ok(())
}

#[test]
fn wrong_input_shape_is_invalid_input() -> Result<()> {
    common::setup();
    let artifact = compile(diamond_graph(), &CompilerOptions::default())?;
    let err = artifact
        .execute(&[common::tensor(&[4, 3], vec![0.0; 12])])
        .unwrap_err();
    assert!(matches!(err, nnrt::Error::InvalidInput(_)), "{err}");
    Ok(())
}

fn branch(kind: OpKind) -> Graph {
    let mut graph = Graph::new();
    let a = graph.add_operand(OperandInfo::new(Shape::unknown(1), DType::F32));
    let b = graph.add_operand(OperandInfo::new(Shape::unknown(1), DType::F32));
    graph.add_input(a);
    match kind {
        OpKind::BinaryArithmetic { .. } => graph.add_op(kind, [a, a], [b]),
        other => graph.add_op(other, [a], [b]),
    };
    graph.add_output(b);
    graph
}

/// `if cond { x + x } else { relu(x) }`
fn conditional_model() -> (Model, SubgraphIndex, SubgraphIndex) {
    let mut main = Graph::new();
    let cond = main.add_operand(OperandInfo::new(Shape::from_static(&[1]), DType::Bool));
    let x = main.add_operand(OperandInfo::f32(&[3]));
    let y = main.add_operand(OperandInfo::new(Shape::unknown(1), DType::F32));
    main.add_input(cond);
    main.add_input(x);
    main.add_output(y);

    let mut model = Model::single(main);
    let then_subgraph = model.push_subgraph(branch(common::add()));
    let else_subgraph = model.push_subgraph(branch(OpKind::ElementwiseActivation(Activation::Relu)));
    model
        .subgraph_mut(SubgraphIndex::PRIMARY)
        .expect("primary subgraph")
        .add_op(
            OpKind::If {
                then_subgraph,
                else_subgraph,
            },
            [cond, x],
            [y],
        );
    (model, then_subgraph, else_subgraph)
}

fn condition(value: bool) -> HostTensor {
    HostTensor::new(vec![1], TensorData::Bool(vec![value])).expect("valid tensor")
}

#[test]
fn if_runs_the_selected_branch() -> Result<()> {
    common::setup();
    for executor in [ExecutorKind::Linear, ExecutorKind::Dataflow] {
        let (model, then_subgraph, else_subgraph) = conditional_model();
        let options = CompilerOptions::default().with_executor(executor);
        let artifact = compile(model, &options)?;
        assert_eq!(artifact.executors().len(), 3);
        assert!(artifact.executors().get(ModelIndex::PRIMARY, then_subgraph).is_some());
        assert!(artifact.executors().get(ModelIndex::PRIMARY, else_subgraph).is_some());

        let x = common::tensor(&[3], vec![-1.0, 0.5, 2.0]);
        let taken = artifact.execute(&[condition(true), x.clone()])?;
        assert_eq!(taken[0].as_f32(), Some(&[-2.0, 1.0, 4.0][..]));
        let skipped = artifact.execute(&[condition(false), x])?;
        assert_eq!(skipped[0].as_f32(), Some(&[0.0, 0.5, 2.0][..]));
    }
    Ok(())
}

#[test]
fn every_model_of_a_package_gets_executors() -> Result<()> {
    common::setup();
    let mut package = Package::new();
    package.push_model(Model::single(diamond_graph()));
    let second = package.push_model(Model::single(branch(common::add())));
    // The second model's input is still unknown; give it a shape before compiling.
    let graph = package
        .model_mut(second)
        .and_then(|model| model.subgraph_mut(SubgraphIndex::PRIMARY))
        .expect("second model graph");
    let input = graph.inputs()[0];
    graph.set_shape(input, Shape::from_static(&[2]))?;

    let artifact = compile(package, &CompilerOptions::default())?;
    let outputs = artifact.executors().execute(
        second,
        SubgraphIndex::PRIMARY,
        &[common::tensor(&[2], vec![1.5, -3.0])],
    )?;
    assert_eq!(outputs[0].as_f32(), Some(&[3.0, -6.0][..]));
    assert_eq!(artifact.tracing().subgraph_id(second, SubgraphIndex::PRIMARY), Some(1));
    Ok(())
}

fn read_minmax(path: &std::path::Path) -> Result<Vec<serde_json::Value>> {
    std::fs::read_to_string(path)?
        .lines()
        .map(|line| Ok(serde_json::from_str(line)?))
        .collect()
}

#[test]
fn minmax_records_every_operation_per_run() -> Result<()> {
    common::setup();
    let path = std::env::temp_dir().join(format!("nnrt-minmax-{}.jsonl", std::process::id()));
    let options = CompilerOptions {
        minmax_record_path: Some(path.clone()),
        ..CompilerOptions::default()
    };
    let (dense, _) = common::dense_graph();
    let artifact = compile(dense, &options)?;
    let input = common::tensor(&[2, 3], vec![1.0, 2.0, 3.0, -1.0, -2.0, -3.0]);
    artifact.execute(std::slice::from_ref(&input))?;
    artifact.execute(&[input])?;

    let records = read_minmax(&path)?;
    assert_eq!(records.len(), 6);
    assert_eq!(records[0]["run"], 0);
    assert_eq!(records[5]["run"], 1);
    assert_eq!(records[2]["kind"], "Softmax");
    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn child_subgraphs_share_the_caller_minmax_run() -> Result<()> {
    common::setup();
    let path = std::env::temp_dir().join(format!("nnrt-minmax-if-{}.jsonl", std::process::id()));
    let options = CompilerOptions {
        minmax_record_path: Some(path.clone()),
        ..CompilerOptions::default()
    };
    let (model, then_subgraph, _) = conditional_model();
    let artifact = compile(model, &options)?;
    artifact.execute(&[condition(true), common::tensor(&[3], vec![1.0, -2.0, 0.5])])?;

    let records = read_minmax(&path)?;
    assert_eq!(records.len(), 2);
    let runs: std::collections::BTreeSet<u64> =
        records.iter().filter_map(|record| record["run"].as_u64()).collect();
    assert_eq!(runs, [0].into_iter().collect());
    assert!(records
        .iter()
        .any(|record| record["subgraph"] == serde_json::json!(then_subgraph)));
    let recorder = artifact.executors().minmax().expect("recording enabled");
    assert_eq!(recorder.runs(), 1);
    assert_eq!(recorder.written(), 2);
    std::fs::remove_file(&path)?;
    Ok(())
}

#[test]
fn trace_file_is_written_when_artifact_drops() -> Result<()> {
    common::setup();
    let path = std::env::temp_dir().join(format!("nnrt-trace-{}.json", std::process::id()));
    let options = CompilerOptions {
        trace_filepath: Some(path.clone()),
        ..CompilerOptions::default()
    };
    let artifact = compile(diamond_graph(), &options)?;
    artifact.execute(&[common::tensor(&[3, 4], vec![1.0; 12])])?;
    drop(artifact);

    let trace: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert!(!trace["passes"].as_array().expect("pass list").is_empty());
    assert_eq!(trace["subgraphs"]["model#0/subg#0"], 0);
    std::fs::remove_file(&path)?;
    Ok(())
}
