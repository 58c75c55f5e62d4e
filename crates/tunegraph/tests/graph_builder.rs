use tunegraph::graph::{
    Activation, BatchNormOptions, MatMulOptions, OpAttrs, OpKind, PoolWindow, Shape,
};
use tunegraph::{DType, Error, FusedExpr, Graph};

fn shape_of(graph: &Graph, id: tunegraph::TensorId) -> Vec<usize> {
    graph.tensor(id).unwrap().shape().dims().to_vec()
}

fn assert_config_error<T: std::fmt::Debug>(result: tunegraph::Result<T>) {
    match result {
        Err(Error::Configuration(_)) => {}
        other => panic!("expected configuration error, got {other:?}"),
    }
}

#[test]
fn explicit_output_is_returned_unchanged() {
    let mut graph = Graph::new();
    let a = graph.add_tensor([2, 3], DType::Float32).unwrap();
    let b = graph.add_tensor([2, 3], DType::Float32).unwrap();
    let c = graph.add_tensor([2, 3], DType::Float32).unwrap();
    let tensors_before = graph.tensors().count();

    let out = graph.add(a, b, Some(c)).unwrap();

    assert_eq!(out, c);
    assert_eq!(graph.tensors().count(), tensors_before);
    let producer = graph.producer(c).unwrap().expect("c has a producer");
    assert_eq!(graph.operator(producer).unwrap().output(), c);
    assert_eq!(graph.consumers(a), &[producer]);
}

#[test]
fn omitted_output_is_created_with_inferred_shape_and_dtype() {
    let mut graph = Graph::new();
    let a = graph.add_tensor([4, 1, 3], DType::Float32).unwrap();
    let b = graph.add_tensor([5, 1], DType::Float32).unwrap();
    let out = graph.mul(a, b, None).unwrap();
    assert_ne!(out, a);
    assert_ne!(out, b);
    assert_eq!(shape_of(&graph, out), vec![4, 5, 3]);
    assert_eq!(graph.tensor(out).unwrap().dtype(), DType::Float32);
}

#[test]
fn mismatched_explicit_output_leaves_graph_untouched() {
    let mut graph = Graph::new();
    let a = graph.add_tensor([2, 3], DType::Float32).unwrap();
    let b = graph.add_tensor([2, 3], DType::Float32).unwrap();
    let wrong_shape = graph.add_tensor([3, 2], DType::Float32).unwrap();
    let wrong_dtype = graph.add_tensor([2, 3], DType::Int32).unwrap();

    assert_config_error(graph.add(a, b, Some(wrong_shape)));
    assert_config_error(graph.add(a, b, Some(wrong_dtype)));
    assert!(graph.operators().is_empty());
    assert!(graph.consumers(a).is_empty());
    assert!(graph.producer(wrong_shape).unwrap().is_none());
}

#[test]
fn output_cannot_have_two_producers() {
    let mut graph = Graph::new();
    let x = graph.add_tensor([8], DType::Float32).unwrap();
    let y = graph.relu(x, None).unwrap();
    assert_config_error(graph.sigmoid(x, Some(y)));
    assert_config_error(graph.abs(x, Some(x)));
}

#[test]
fn incompatible_broadcast_is_a_configuration_error() {
    let mut graph = Graph::new();
    let a = graph.add_tensor([2, 3], DType::Float32).unwrap();
    let b = graph.add_tensor([4, 3], DType::Float32).unwrap();
    assert_config_error(graph.sub(a, b, None));
}

#[test]
fn matmul_infers_batch_and_transposes() {
    let mut graph = Graph::new();
    let a = graph.add_tensor([2, 1, 5, 3], DType::Float32).unwrap();
    let b = graph.add_tensor([4, 7, 5], DType::Float32).unwrap();
    let bias = graph.add_tensor([7], DType::Float32).unwrap();
    let options = MatMulOptions {
        trans_a: true,
        trans_b: true,
        bias: Some(bias),
        act: Activation::Relu,
    };
    let out = graph.matmul(a, b, None, options).unwrap();
    assert_eq!(shape_of(&graph, out), vec![2, 4, 3, 7]);
    let op = graph.operator(graph.producer(out).unwrap().unwrap()).unwrap();
    assert_eq!(op.inputs(), &[a, b, bias]);
    assert!(matches!(
        op.attrs(),
        OpAttrs::MatMul {
            trans_a: true,
            trans_b: true,
            has_bias: true,
            act: Activation::Relu
        }
    ));

    let bad = graph.add_tensor([4, 3], DType::Float32).unwrap();
    assert_config_error(graph.matmul(a, bad, None, MatMulOptions::default()));
}

#[test]
fn batch_norm_training_mode_is_rejected() {
    let mut graph = Graph::new();
    let x = graph.add_tensor([2, 3, 4, 4], DType::Float32).unwrap();
    let params: Vec<_> = (0..4)
        .map(|_| graph.add_tensor([3], DType::Float32).unwrap())
        .collect();
    let training = BatchNormOptions {
        training: true,
        ..BatchNormOptions::default()
    };
    assert_config_error(graph.batch_norm(
        x, None, params[0], params[1], params[2], params[3], training,
    ));
    let out = graph
        .batch_norm(
            x,
            None,
            params[0],
            params[1],
            params[2],
            params[3],
            BatchNormOptions::default(),
        )
        .unwrap();
    assert_eq!(shape_of(&graph, out), vec![2, 3, 4, 4]);
}

#[test]
fn pooling_applies_window_geometry() {
    let mut graph = Graph::new();
    let x = graph.add_tensor([1, 2, 7, 9], DType::Float32).unwrap();
    let window = PoolWindow::new(3, 3).with_stride(2, 2).with_padding(1, 1);
    let max = graph.max_pool(x, None, window).unwrap();
    assert_eq!(shape_of(&graph, max), vec![1, 2, 4, 5]);
    let dilated = PoolWindow::new(2, 2).with_stride(1, 1).with_dilation(2, 3);
    let avg = graph.avg_pool(x, None, dilated).unwrap();
    assert_eq!(shape_of(&graph, avg), vec![1, 2, 5, 6]);

    let vector = graph.add_tensor([9], DType::Float32).unwrap();
    assert_config_error(graph.max_pool(vector, None, window));
}

#[test]
fn oversized_pool_window_is_a_configuration_error() {
    let mut graph = Graph::new();
    let x = graph.add_tensor([1, 1, 4, 4], DType::Float32).unwrap();
    let padded = PoolWindow::new(2, 2).with_padding(usize::MAX / 2 + 1, 0);
    assert_config_error(graph.max_pool(x, None, padded));
    let dilated = PoolWindow::new(3, 3).with_dilation(usize::MAX, 1);
    assert_config_error(graph.avg_pool(x, None, dilated));
    assert_eq!(graph.operators().len(), 0);
}

#[test]
fn shape_ops_infer_outputs() {
    let mut graph = Graph::new();
    let x = graph.add_tensor([2, 3, 4], DType::Float32).unwrap();
    let flat = graph.flatten(x, None).unwrap();
    assert_eq!(shape_of(&graph, flat), vec![2, 12]);

    let reshaped = graph.reshape(x, None, &[4, 6]).unwrap();
    assert_eq!(shape_of(&graph, reshaped), vec![4, 6]);
    assert_config_error(graph.reshape(x, None, &[5, 5]));

    let y = graph.add_tensor([2, 5, 4], DType::Float32).unwrap();
    let joined = graph.concat(&[x, y], None, -2).unwrap();
    assert_eq!(shape_of(&graph, joined), vec![2, 8, 4]);
    assert_config_error(graph.concat(&[x, reshaped], None, 0));

    let indices = graph.add_tensor([5, 2], DType::Int64).unwrap();
    let gathered = graph.gather(x, indices, None, 1).unwrap();
    assert_eq!(shape_of(&graph, gathered), vec![2, 5, 2, 4]);
    let float_indices = graph.add_tensor([5], DType::Float32).unwrap();
    assert_config_error(graph.gather(x, float_indices, None, 0));

    let mean = graph.reduce_mean(x, None, Some(&[-1, 0]), true).unwrap();
    assert_eq!(shape_of(&graph, mean), vec![1, 3, 1]);
    let all = graph.reduce_mean(x, None, None, false).unwrap();
    assert_eq!(shape_of(&graph, all), Vec::<usize>::new());

    let soft = graph.softmax(x, None).unwrap();
    assert_eq!(graph.tensor(soft).unwrap().shape(), &Shape::new([2, 3, 4]));
}

#[test]
fn mem_bound_validates_expression_and_dtypes() {
    let mut graph = Graph::new();
    let a = graph.add_tensor([4, 4], DType::Float32).unwrap();
    let b = graph.add_tensor([4], DType::Float32).unwrap();
    let expr = FusedExpr::relu(FusedExpr::add(FusedExpr::input(0), FusedExpr::input(1)));
    let out = graph.mem_bound(&[a, b], None, expr.clone()).unwrap();
    assert_eq!(shape_of(&graph, out), vec![4, 4]);
    let op = graph.operator(graph.producer(out).unwrap().unwrap()).unwrap();
    assert_eq!(op.kind(), OpKind::MemBound);
    assert_eq!(op.fused_expr(), Some(&expr));

    assert_config_error(graph.mem_bound(&[a], None, expr));
    let ints = graph.add_tensor([4, 4], DType::Int32).unwrap();
    assert_config_error(graph.mem_bound(&[ints], None, FusedExpr::input(0)));
    assert_config_error(graph.mem_bound(&[], None, FusedExpr::constant(1.0)));
}

#[test]
fn topo_order_follows_dataflow() {
    let mut graph = Graph::new();
    let x = graph.add_tensor([3], DType::Float32).unwrap();
    let late = graph.add_tensor([3], DType::Float32).unwrap();
    // `late` is consumed before it is produced in insertion order.
    let sum = graph.add(x, late, None).unwrap();
    graph.relu(x, Some(late)).unwrap();
    let order = graph.topo_order().unwrap();
    let relu_op = graph.producer(late).unwrap().unwrap();
    let add_op = graph.producer(sum).unwrap().unwrap();
    assert_eq!(order, vec![relu_op, add_op]);
}

#[test]
fn cycles_are_rejected_by_topo_order() {
    let mut graph = Graph::new();
    let x = graph.add_tensor([3], DType::Float32).unwrap();
    let y = graph.relu(x, None).unwrap();
    graph.tanh(y, Some(x)).unwrap();
    assert_config_error(graph.topo_order());
}

#[test]
fn host_io_requires_bound_storage() {
    let graph_with_tensor = {
        let mut graph = Graph::new();
        let x = graph.add_tensor([2], DType::Float32).unwrap();
        (graph, x)
    };
    let (graph, x) = graph_with_tensor;
    assert_config_error(graph.write_f32(x, &[1.0, 2.0]));
    assert_config_error(graph.read_f32(x));
}

#[test]
fn tensor_and_operator_ids_are_unique_across_graphs() {
    let mut first = Graph::new();
    let mut second = Graph::new();
    let a = first.add_tensor([1], DType::Float32).unwrap();
    let b = second.add_tensor([1], DType::Float32).unwrap();
    assert_ne!(a, b);
    assert_ne!(a.var_name(), b.var_name());
}
