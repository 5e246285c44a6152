use super::fixtures::*;
use crate::phasor::Phase;
use crate::{
    calculate, run_profile, CableReplacement, CalcOptions, CompensationMode, CompensatorConfig,
    ConvergenceStatus, DemandLevel, DeviceStatus, Diagnostic, EquipmentSet, RadialSweep,
    Scenario,
};
use anyhow::{format_err, Result};

#[test]
fn plain_calculation() -> Result<()> {
    let r = run(&feeder(), &EquipmentSet::default())?;
    assert!(r.is_converged());
    assert_eq!(r.iterations, 1);
    assert_eq!(r.nodes.len(), 4);
    assert_eq!(r.cables.len(), 3);
    assert!(r.diagnostics.is_empty());

    let n3 = voltage(&r, "n3")?;
    // phase B carries most of the load
    assert!(n3[Phase::B] < n3[Phase::A] && n3[Phase::B] < n3[Phase::C]);
    let c3 = &r.cables["c3"];
    assert!(c3.neutral_current > 1.0);
    assert!(c3.loading_percent > 0.0);
    Ok(())
}

#[test]
fn coupled_devices_settle() -> Result<()> {
    let net = feeder();
    let base = run(&net, &EquipmentSet::default())?;
    let r = run(&net, &with_both()?)?;
    assert!(r.is_converged(), "diagnostics: {:?}", r.diagnostics);
    assert!(r.iterations >= 1 && r.iterations <= 10);

    let comp = r
        .compensator("cme")
        .ok_or_else(|| format_err!("no compensator result"))?;
    assert_eq!(comp.status, DeviceStatus::Active);
    assert!(comp.achieved_spread < comp.natural_spread);
    assert!(r.injections.contains_key("n3"));

    let reg = r
        .regulator("srg2")
        .ok_or_else(|| format_err!("no regulator result"))?;
    assert!(reg.converged);
    let n2 = voltage(&r, "n2")?;
    for p in Phase::ALL {
        assert!((reg.output_voltage[p] - n2[p]).abs() < 1e-9);
    }

    let spread_before = voltage(&base, "n3")?.spread();
    let spread_after = voltage(&r, "n3")?.spread();
    assert!(spread_after < spread_before);
    Ok(())
}

#[test]
fn missing_node_is_reported_not_fatal() -> Result<()> {
    let comp = CompensatorConfig::new("ghost", "n9").build()?;
    let r = run(&feeder(), &EquipmentSet::default().with_compensator(comp))?;
    assert!(r.is_converged());
    let c = r
        .compensator("ghost")
        .ok_or_else(|| format_err!("no compensator result"))?;
    assert!(matches!(c.status, DeviceStatus::Skipped(_)));
    assert!(r
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::MissingNode { node, .. } if node == "n9")));
    Ok(())
}

#[test]
fn unreachable_nodes_are_left_out() -> Result<()> {
    let comp = CompensatorConfig::new("lost", "island").build()?;
    let r = run(&feeder_with_island(), &EquipmentSet::default().with_compensator(comp))?;
    assert!(r.voltage("island").is_none());
    assert!(r
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::UnreachableNode { node } if node == "island")));
    let c = r
        .compensator("lost")
        .ok_or_else(|| format_err!("no compensator result"))?;
    assert!(matches!(c.status, DeviceStatus::Skipped(_)));
    Ok(())
}

#[test]
fn malformed_network_is_an_error() {
    let mut net = feeder();
    net.cables.push(crate::Cable::new("loop", "n3", "n1", "al95", 50.0));
    assert!(run(&net, &EquipmentSet::default()).is_err());

    let mut net = feeder();
    net.nodes[0].source = None;
    assert!(run(&net, &EquipmentSet::default()).is_err());
}

#[test]
fn cable_replacement_stays_in_the_call() -> Result<()> {
    let net = feeder();
    let base = run(&net, &EquipmentSet::default())?;
    let eq = EquipmentSet::default().with_replacement(CableReplacement::new("c2", "al150"));
    let upgraded = run(&net, &eq)?;
    assert!(voltage(&upgraded, "n3")?[Phase::B] > voltage(&base, "n3")?[Phase::B]);

    // the caller's network is untouched and a new call sees the original cable
    assert_eq!(net.cables[1].cable_type, "al95");
    let again = run(&net, &EquipmentSet::default())?;
    assert_eq!(again, base);
    Ok(())
}

#[test]
fn production_scenario_raises_voltage() -> Result<()> {
    let mut opt = CalcOptions::default();
    opt.scenario = Scenario::Production;
    let r = calculate(&feeder(), &opt, &EquipmentSet::default(), &RadialSweep)?;
    assert_eq!(r.scenario, Scenario::Production);
    // the only production sits on phase A at n3
    assert!(voltage(&r, "n3")?[Phase::A] > 230.0);
    Ok(())
}

#[test]
fn profile_carries_warm_start() -> Result<()> {
    let levels = vec![
        DemandLevel::new("night", 0.5, 0.0),
        DemandLevel::new("evening", 1.0, 0.0),
        DemandLevel::new("late", 0.8, 0.0),
    ];
    let results = run_profile(
        &feeder(),
        &CalcOptions::default(),
        &with_compensator()?,
        &levels,
        &RadialSweep,
    )?;
    assert_eq!(results.len(), levels.len());
    assert!(results[0].injections.contains_key("n3"));

    // the heavier level needs more compensation
    let i0 = results[0].injections["n3"].magnitude();
    let i1 = results[1].injections["n3"].magnitude();
    assert!(i1 > i0);

    // a warm-started single call lands on the same calibration
    let mut eq = with_compensator()?;
    eq.warm_start = results[0].injections.clone();
    let mut opt = CalcOptions::default();
    opt.load_factor = 1.0;
    let warm = calculate(&feeder(), &opt, &eq, &RadialSweep)?;
    let tol = opt.calibration.tolerance;
    let a = warm.compensator("cme").map(|c| c.achieved_spread);
    let b = results[1].compensator("cme").map(|c| c.achieved_spread);
    match (a, b) {
        (Some(a), Some(b)) => assert!((a - b).abs() <= 2.0 * tol + 1e-9),
        _ => return Err(format_err!("missing compensator results")),
    }
    Ok(())
}

#[test]
fn estimate_mode_follows_each_profile_level() -> Result<()> {
    let mut comp = crate::demo::sample_compensator()?;
    comp.mode = CompensationMode::Estimate;
    let eq = EquipmentSet::default().with_compensator(comp);
    let levels = vec![
        DemandLevel::new("low", 0.3, 1.0),
        DemandLevel::new("peak", 1.0, 1.0),
    ];
    let results = run_profile(&feeder(), &CalcOptions::default(), &eq, &levels, &RadialSweep)?;

    let mut opt = CalcOptions::default();
    opt.load_factor = 1.0;
    opt.production_factor = 1.0;
    let alone = calculate(&feeder(), &opt, &eq, &RadialSweep)?;

    let current = |r: &crate::CalculationResult| {
        r.compensator("cme")
            .map(|c| c.injected_current)
            .ok_or_else(|| format_err!("no compensator result"))
    };
    let (low, peak, single) = (current(&results[0])?, current(&results[1])?, current(&alone)?);
    assert!((peak - single).abs() < 1e-6, "profile {} A, single call {} A", peak, single);
    assert!(peak > low);
    assert_eq!(results[1], alone);
    Ok(())
}

#[test]
fn calibration_budget_exhausted() -> Result<()> {
    let mut opt = CalcOptions::default();
    opt.calibration.max_iterations = 1;
    opt.calibration.tolerance = 1e-6;
    let r = calculate(&feeder(), &opt, &with_compensator()?, &RadialSweep)?;

    assert_eq!(r.status, ConvergenceStatus::NotConverged);
    let c = r
        .compensator("cme")
        .ok_or_else(|| format_err!("no compensator result"))?;
    assert!(!c.converged);
    assert!(!c.thermally_limited);
    assert_eq!(c.iterations, 1);
    // the last iterate is still reported
    assert!(c.injected_current > 0.0);
    assert!(r.injections.contains_key("n3"));
    assert!(r
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::CompensatorNotConverged { device, .. }
            if device == "cme")));
    Ok(())
}

#[test]
fn regulator_budget_exhausted() -> Result<()> {
    let mut opt = CalcOptions::default();
    opt.max_regulator_iterations = 1;
    let r = calculate(&feeder(), &opt, &with_regulator()?, &RadialSweep)?;

    // the first evaluation switches phase B out of bypass
    assert_eq!(r.status, ConvergenceStatus::NotConverged);
    assert_eq!(r.iterations, 1);
    let reg = r
        .regulator("srg2")
        .ok_or_else(|| format_err!("no regulator result"))?;
    assert!(!reg.converged);
    assert!(reg.state[Phase::B].level() > 0);
    assert!(r
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::RegulatorNotSettled { device, .. }
            if device == "srg2")));

    // the tables describe the switched state
    let base = run(&feeder(), &EquipmentSet::default())?;
    assert!(voltage(&r, "n3")?[Phase::B] > voltage(&base, "n3")?[Phase::B]);
    Ok(())
}

#[test]
fn coupling_budget_exhausted() -> Result<()> {
    let mut opt = CalcOptions::default();
    opt.max_coupling_iterations = 1;
    let r = calculate(&feeder(), &opt, &with_both()?, &RadialSweep)?;

    assert_eq!(r.status, ConvergenceStatus::NotConverged);
    assert_eq!(r.iterations, 1);
    assert!(r
        .diagnostics
        .iter()
        .any(|d| matches!(d, Diagnostic::CouplingNotConverged { iterations: 1 })));
    let reg = r
        .regulator("srg2")
        .ok_or_else(|| format_err!("no regulator result"))?;
    assert!(!reg.converged);
    assert!(reg.state[Phase::B].level() > 0);
    Ok(())
}
