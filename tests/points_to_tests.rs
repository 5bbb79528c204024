//! Integration tests for the interprocedural points-to engine

mod common;

use std::collections::BTreeSet;

use cil_analysis::analysis::points_to::result_variable;
use cil_analysis::analysis::NodeKey;
use cil_analysis::common::types::*;
use cil_analysis::{Analyzer, AnalyzerConfig};

use common::*;

fn node_type_names(
    output: &cil_analysis::AnalysisOutput,
    targets: &BTreeSet<cil_analysis::analysis::NodeId>,
) -> BTreeSet<String> {
    targets
        .iter()
        .filter_map(|id| output.arena.node_type(*id))
        .map(|ty| ty.name.clone())
        .collect()
}

#[test]
fn virtual_call_devirtualizes_to_the_single_target() {
    init_tracing();
    let a = obj_type("A");
    let b = obj_type("B");
    let t = obj_type("Program");

    let a_foo = instance_method(&a, "foo", vec![], TypeRef::void());
    let b_foo = instance_method(&b, "foo", vec![], TypeRef::void());
    let b_ctor = ctor_of(&b);
    let main = static_method(&t, "main", vec![], TypeRef::void());

    let mut host = TestHost::new();
    host.add_method(define(b_ctor.clone(), vec![], vec![], 1, vec![op(0, OpKind::Ret)]));
    host.add_method(define(b_foo.clone(), vec![], vec![], 1, vec![op(0, OpKind::Ret)]));
    host.add_override(&b, &a_foo, b_foo.clone());
    host.add_method(define(
        main.clone(),
        vec![],
        vec!["v"],
        2,
        vec![
            op_with(0, OpKind::Newobj, OpValue::Method(b_ctor)),
            op_with(1, OpKind::Stloc, OpValue::Local("v".into())),
            op_with(2, OpKind::Ldloc, OpValue::Local("v".into())),
            op_with(3, OpKind::Callvirt, OpValue::Method(a_foo.clone())),
            op(4, OpKind::Ret),
        ],
    ));

    let analyzer = Analyzer::new(AnalyzerConfig::default());
    let output = analyzer.analyze(&host, &main).unwrap();

    // The static edge is recorded unconditionally; the dynamic edge comes
    // from the receiver's single points-to target.
    let callees = output.call_graph.callees(&main, "L_0003").unwrap();
    assert!(callees.contains(&a_foo));
    assert!(callees.contains(&b_foo));

    // Only the devirtualized implementation was analyzed.
    assert!(output
        .info
        .get(&b_foo)
        .and_then(|e| e.input_ptg.as_ref())
        .is_some());
    assert!(output
        .info
        .get(&a_foo)
        .and_then(|e| e.input_ptg.as_ref())
        .is_none());
}

#[test]
fn mutual_recursion_reaches_a_fixed_point() {
    init_tracing();
    let t = obj_type("Factory");
    let ca = obj_type("CA");
    let cb = obj_type("CB");

    let make_a = static_method(&t, "make_a", vec![], TypeRef::object());
    let make_b = static_method(&t, "make_b", vec![], TypeRef::object());

    // make_a: if (c) return new CA(); else return make_b();  (and vice versa)
    let body = |other: &MethodRef, own_ctor: &MethodRef| {
        vec![
            op_with(0, OpKind::Ldc, OpValue::I32(1)),
            op_with(1, OpKind::Brtrue, OpValue::Target(4)),
            op_with(2, OpKind::Call, OpValue::Method(other.clone())),
            op(3, OpKind::Ret),
            op_with(4, OpKind::Newobj, OpValue::Method(own_ctor.clone())),
            op(5, OpKind::Ret),
        ]
    };

    let mut host = TestHost::new();
    host.add_method(define(
        make_a.clone(),
        vec![],
        vec![],
        1,
        body(&make_b, &ctor_of(&ca)),
    ));
    host.add_method(define(
        make_b.clone(),
        vec![],
        vec![],
        1,
        body(&make_a, &ctor_of(&cb)),
    ));

    let analyzer = Analyzer::new(AnalyzerConfig::default());
    let output = analyzer.analyze(&host, &make_a).unwrap();

    // The root's return targets cover the allocation sites of both methods.
    let exit = output
        .info
        .get(&make_a)
        .and_then(|e| e.output_ptg.as_ref())
        .unwrap();
    let names = node_type_names(&output, &exit.targets(&result_variable()));
    assert_eq!(names, BTreeSet::from(["CA".to_string(), "CB".to_string()]));

    // Both recursion edges are present.
    assert!(output.call_graph.contains_edge(&make_a, "L_0002", &make_b));
    assert!(output.call_graph.contains_edge(&make_b, "L_0002", &make_a));
}

#[test]
fn skipped_unknown_callee_leaves_no_trace() {
    let t = obj_type("Program");
    let ext = static_method(&obj_type("External"), "fetch", vec![], TypeRef::object());
    let main = static_method(&t, "main", vec![], TypeRef::void());

    let mut host = TestHost::new();
    host.add_method(define(
        main.clone(),
        vec![],
        vec![],
        1,
        vec![
            op_with(0, OpKind::Call, OpValue::Method(ext.clone())),
            op(1, OpKind::Pop),
            op(2, OpKind::Ret),
        ],
    ));

    let analyzer = Analyzer::new(AnalyzerConfig::default());
    let output = analyzer.analyze(&host, &main).unwrap();

    // The static call edge is still recorded...
    assert!(output.call_graph.contains_edge(&main, "L_0000", &ext));
    // ...but no analysis state was written for the skipped callee.
    assert!(output
        .info
        .get(&ext)
        .and_then(|e| e.input_ptg.as_ref())
        .is_none());
}

#[test]
fn modeled_unknown_callee_gets_an_input_graph() {
    let t = obj_type("Program");
    let ext = static_method(&obj_type("External"), "fetch", vec![], TypeRef::object());
    let main = static_method(&t, "main", vec![], TypeRef::void());

    let mut host = TestHost::new();
    host.model_unknown(ext.clone());
    host.add_method(define(
        main.clone(),
        vec![],
        vec![],
        1,
        vec![
            op_with(0, OpKind::Call, OpValue::Method(ext.clone())),
            op(1, OpKind::Pop),
            op(2, OpKind::Ret),
        ],
    ));

    let analyzer = Analyzer::new(AnalyzerConfig::default());
    let output = analyzer.analyze(&host, &main).unwrap();

    let entry = output.info.get(&ext).unwrap();
    assert!(entry.input_ptg.is_some());
    assert!(entry.output_ptg.is_some());
    assert_eq!(entry.summary(), "INPUT_PTG OUTPUT_PTG");
}

#[test]
fn returned_allocation_flows_to_the_caller() {
    let t = obj_type("Program");
    let widget = obj_type("Widget");
    let make = static_method(&t, "make", vec![], TypeRef::object());
    let main = static_method(&t, "main", vec![], TypeRef::object());

    let mut host = TestHost::new();
    host.add_method(define(
        make.clone(),
        vec![],
        vec![],
        1,
        vec![
            op_with(0, OpKind::Newobj, OpValue::Method(ctor_of(&widget))),
            op(1, OpKind::Ret),
        ],
    ));
    host.add_method(define(
        main.clone(),
        vec![],
        vec![],
        1,
        vec![
            op_with(0, OpKind::Call, OpValue::Method(make.clone())),
            op(1, OpKind::Ret),
        ],
    ));

    let analyzer = Analyzer::new(AnalyzerConfig::default());
    let output = analyzer.analyze(&host, &main).unwrap();

    let exit = output
        .info
        .get(&main)
        .and_then(|e| e.output_ptg.as_ref())
        .unwrap();
    let names = node_type_names(&output, &exit.targets(&result_variable()));
    assert_eq!(names, BTreeSet::from(["Widget".to_string()]));
}

#[test]
fn parameters_are_seeded_with_entry_nodes() {
    let t = obj_type("Program");
    let item = obj_type("Item");
    let id = static_method(&t, "id", vec![item.clone()], item.clone());

    let mut host = TestHost::new();
    host.add_method(define(
        id.clone(),
        vec![("x", item.clone())],
        vec![],
        1,
        vec![
            op_with(0, OpKind::Ldarg, OpValue::Param(0)),
            op(1, OpKind::Ret),
        ],
    ));

    let analyzer = Analyzer::new(AnalyzerConfig::default());
    let output = analyzer.analyze(&host, &id).unwrap();

    let exit = output
        .info
        .get(&id)
        .and_then(|e| e.output_ptg.as_ref())
        .unwrap();
    let targets = exit.targets(&result_variable());
    assert_eq!(targets.len(), 1);
    let node = *targets.iter().next().unwrap();
    assert!(matches!(
        output.arena.key(node),
        Some(NodeKey::ParamEntry { index: 0, .. })
    ));
}

#[test]
fn static_fields_flow_through_the_static_area() {
    let t = obj_type("Program");
    let cache = obj_type("Cache");
    let field = FieldRef {
        containing_type: t.clone(),
        name: "shared".into(),
        field_type: cache.clone(),
    };
    let main = static_method(&t, "main", vec![], TypeRef::object());

    let mut host = TestHost::new();
    host.add_method(define(
        main.clone(),
        vec![],
        vec![],
        1,
        vec![
            op_with(0, OpKind::Newobj, OpValue::Method(ctor_of(&cache))),
            op_with(1, OpKind::Stsfld, OpValue::Field(field.clone())),
            op_with(2, OpKind::Ldsfld, OpValue::Field(field)),
            op(3, OpKind::Ret),
        ],
    ));

    let analyzer = Analyzer::new(AnalyzerConfig::default());
    let output = analyzer.analyze(&host, &main).unwrap();

    let exit = output
        .info
        .get(&main)
        .and_then(|e| e.output_ptg.as_ref())
        .unwrap();
    let names = node_type_names(&output, &exit.targets(&result_variable()));
    assert_eq!(names, BTreeSet::from(["Cache".to_string()]));
}

#[test]
fn call_graph_grows_monotonically_across_reruns() {
    // Devirtualization discovers the callee only after the allocation flows
    // through a field; the edge set never shrinks while it grows.
    let t = obj_type("Program");
    let a = obj_type("A");
    let b = obj_type("B");
    let holder = obj_type("Holder");
    let field = FieldRef {
        containing_type: holder.clone(),
        name: "slot".into(),
        field_type: a.clone(),
    };

    let a_run = instance_method(&a, "run", vec![], TypeRef::void());
    let b_run = instance_method(&b, "run", vec![], TypeRef::void());
    let main = static_method(&t, "main", vec![], TypeRef::void());

    let mut host = TestHost::new();
    host.add_method(define(b_run.clone(), vec![], vec![], 1, vec![op(0, OpKind::Ret)]));
    host.add_method(define(ctor_of(&holder), vec![], vec![], 1, vec![op(0, OpKind::Ret)]));
    host.add_method(define(ctor_of(&b), vec![], vec![], 1, vec![op(0, OpKind::Ret)]));
    host.add_override(&b, &a_run, b_run.clone());
    host.add_method(define(
        main.clone(),
        vec![],
        vec!["h"],
        3,
        vec![
            op_with(0, OpKind::Newobj, OpValue::Method(ctor_of(&holder))),
            op_with(1, OpKind::Stloc, OpValue::Local("h".into())),
            op_with(2, OpKind::Ldloc, OpValue::Local("h".into())),
            op_with(3, OpKind::Newobj, OpValue::Method(ctor_of(&b))),
            op_with(4, OpKind::Stfld, OpValue::Field(field.clone())),
            op_with(5, OpKind::Ldloc, OpValue::Local("h".into())),
            op_with(6, OpKind::Ldfld, OpValue::Field(field)),
            op_with(7, OpKind::Callvirt, OpValue::Method(a_run.clone())),
            op(8, OpKind::Ret),
        ],
    ));

    let analyzer = Analyzer::new(AnalyzerConfig::default());
    let output = analyzer.analyze(&host, &main).unwrap();

    let callees = output.call_graph.callees(&main, "L_0007").unwrap();
    assert!(callees.contains(&a_run));
    assert!(callees.contains(&b_run));
    assert!(output
        .info
        .get(&b_run)
        .and_then(|e| e.input_ptg.as_ref())
        .is_some());
}

#[test]
fn devirtualization_can_be_disabled() {
    let a = obj_type("A");
    let b = obj_type("B");
    let t = obj_type("Program");

    let a_foo = instance_method(&a, "foo", vec![], TypeRef::void());
    let b_foo = instance_method(&b, "foo", vec![], TypeRef::void());

    let main = static_method(&t, "main", vec![], TypeRef::void());
    let mut host = TestHost::new();
    host.add_method(define(ctor_of(&b), vec![], vec![], 1, vec![op(0, OpKind::Ret)]));
    host.add_method(define(b_foo.clone(), vec![], vec![], 1, vec![op(0, OpKind::Ret)]));
    host.add_override(&b, &a_foo, b_foo.clone());
    host.add_method(define(
        main.clone(),
        vec![],
        vec![],
        2,
        vec![
            op_with(0, OpKind::Newobj, OpValue::Method(ctor_of(&b))),
            op_with(1, OpKind::Callvirt, OpValue::Method(a_foo.clone())),
            op(2, OpKind::Ret),
        ],
    ));

    let mut config = AnalyzerConfig::default();
    config.engine.devirtualize = false;
    let analyzer = Analyzer::new(config);
    let output = analyzer.analyze(&host, &main).unwrap();

    let callees = output.call_graph.callees(&main, "L_0001").unwrap();
    assert!(callees.contains(&a_foo));
    assert!(!callees.contains(&b_foo));
}
