//! Qdisc chain construction.
//!
//! Translates a [`LinkConstraints`] group into the ordered `tc` invocations
//! that realise it on an interface. The caller decides where the commands run
//! (host namespace or inside a node).

use crate::constraint::{
    ConstraintError, LinkConstraints, DEFAULT_JITTER_CORRELATION, DEFAULT_LOSS_CORRELATION,
};
use crate::number::Number64;

/// Build the `tc` command lines for one constrained interface.
///
/// Each returned vector is a full argv, starting with `tc`. Commands must be
/// executed in order: the rate limiter (when present) takes the root handle
/// and the netem qdisc attaches beneath it.
///
/// ```
/// use munet_tc::{qdisc_commands, LinkConstraints, Number64};
///
/// let constraints = LinkConstraints { delay: Some(Number64::new(10_000)), ..Default::default() };
/// let commands = qdisc_commands("eth0", &constraints).unwrap();
/// assert_eq!(commands[0][..8], ["tc", "qdisc", "add", "dev", "eth0", "root", "handle", "1:"]);
/// ```
pub fn qdisc_commands(
    dev: &str,
    constraints: &LinkConstraints,
) -> Result<Vec<Vec<String>>, ConstraintError> {
    constraints.validate()?;

    let netem = netem_args(constraints);
    let tbf = tbf_args(constraints);

    let mut commands = Vec::new();
    let mut handle = 1u32;

    if let Some(tbf) = tbf {
        let mut argv = qdisc_add(dev, None, handle);
        argv.push("tbf".to_string());
        argv.extend(tbf);
        commands.push(argv);
        handle += 1;
    }

    if let Some(netem) = netem {
        let parent = (handle > 1).then(|| handle - 1);
        let mut argv = qdisc_add(dev, parent, handle);
        argv.push("netem".to_string());
        argv.extend(netem);
        commands.push(argv);
    }

    Ok(commands)
}

fn qdisc_add(dev: &str, parent: Option<u32>, handle: u32) -> Vec<String> {
    let mut argv: Vec<String> =
        ["tc", "qdisc", "add", "dev", dev].iter().map(|s| s.to_string()).collect();
    match parent {
        Some(parent) => {
            argv.push("parent".to_string());
            argv.push(format!("{parent}:"));
        }
        None => argv.push("root".to_string()),
    }
    argv.push("handle".to_string());
    argv.push(format!("{handle}:"));
    argv
}

fn netem_args(constraints: &LinkConstraints) -> Option<Vec<String>> {
    if !constraints.has_emulation() {
        return None;
    }

    let mut args = Vec::new();

    if let Some(delay) = constraints.delay {
        args.push("delay".to_string());
        args.push(format!("{delay}usec"));

        if let Some(jitter) = constraints.jitter {
            let correlation = percent(constraints.jitter_correlation, DEFAULT_JITTER_CORRELATION);
            args.push(format!("{jitter}usec"));
            args.push(correlation);
        }
    }

    if let Some(loss) = constraints.loss {
        let correlation = percent(constraints.loss_correlation, DEFAULT_LOSS_CORRELATION);
        args.push("loss".to_string());
        args.push(format!("{loss}%"));
        args.push(correlation);
    }

    Some(args)
}

fn tbf_args(constraints: &LinkConstraints) -> Option<Vec<String>> {
    let rate = constraints.rate.as_ref()?;
    Some(vec![
        "rate".to_string(),
        format!("{}bit", rate.rate()),
        "limit".to_string(),
        rate.limit().to_string(),
        "burst".to_string(),
        rate.burst().to_string(),
    ])
}

fn percent(value: Option<Number64>, default: u64) -> String {
    format!("{}%", value.map(Number64::get).unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraint::RateLimit;

    fn args(dev: &str, constraints: &LinkConstraints) -> Vec<String> {
        qdisc_commands(dev, constraints).unwrap().into_iter().flatten().collect()
    }

    #[test]
    fn empty_constraints_produce_no_commands() {
        assert!(qdisc_commands("eth0", &LinkConstraints::default()).unwrap().is_empty());
    }

    #[test]
    fn rate_only_builds_a_single_tbf_root() {
        let constraints = LinkConstraints {
            rate: Some(RateLimit::Scalar(Number64::new(1_000_000))),
            ..Default::default()
        };
        let commands = qdisc_commands("eth0", &constraints).unwrap();
        assert_eq!(commands.len(), 1);
        let line = commands[0].join(" ");
        assert_eq!(
            line,
            "tc qdisc add dev eth0 root handle 1: tbf rate 1000000bit limit 1518 burst 3036"
        );
    }

    #[test]
    fn delay_only_builds_a_single_netem_root() {
        let constraints =
            LinkConstraints { delay: Some(Number64::new(10_000)), ..Default::default() };
        let commands = qdisc_commands("eth0", &constraints).unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].join(" "), "tc qdisc add dev eth0 root handle 1: netem delay 10000usec");
    }

    #[test]
    fn jitter_and_loss_carry_default_correlations() {
        let constraints = LinkConstraints {
            delay: Some(Number64::new(10_000)),
            jitter: Some(Number64::new(1_000)),
            loss: Some(Number64::new(5)),
            ..Default::default()
        };
        let line = args("eth0", &constraints).join(" ");
        assert!(line.contains("delay 10000usec 1000usec 10%"), "{line}");
        assert!(line.contains("loss 5% 25%"), "{line}");
    }

    #[test]
    fn explicit_correlations_override_defaults() {
        let constraints = LinkConstraints {
            delay: Some(Number64::new(10_000)),
            jitter: Some(Number64::new(1_000)),
            jitter_correlation: Some(Number64::new(42)),
            loss: Some(Number64::new(5)),
            loss_correlation: Some(Number64::new(7)),
            ..Default::default()
        };
        let line = args("eth0", &constraints).join(" ");
        assert!(line.contains("delay 10000usec 1000usec 42%"), "{line}");
        assert!(line.contains("loss 5% 7%"), "{line}");
    }

    #[test]
    fn rate_and_delay_stack_netem_under_tbf() {
        let constraints = LinkConstraints {
            delay: Some(Number64::new(200_000)),
            rate: Some(RateLimit::Detailed {
                rate: Number64::new(10_000_000),
                limit: Some(Number64::new(9_000)),
                burst: None,
            }),
            ..Default::default()
        };
        let commands = qdisc_commands("p2p1", &constraints).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0].join(" "),
            "tc qdisc add dev p2p1 root handle 1: tbf rate 10000000bit limit 9000 burst 3036"
        );
        assert_eq!(
            commands[1].join(" "),
            "tc qdisc add dev p2p1 parent 1: handle 2: netem delay 200000usec"
        );
    }

    #[test]
    fn invalid_groups_are_rejected() {
        let constraints =
            LinkConstraints { jitter: Some(Number64::new(100)), ..Default::default() };
        assert!(qdisc_commands("eth0", &constraints).is_err());
    }
}
