use crate::domain::model::{ExecutionPlan, ServiceDescriptor, ServiceKind, Tier};
use crate::utils::error::{OrchError, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// 從 descriptor 集合推導啟動計畫
///
/// 驗證依賴存在性、偵測循環，再以 Kahn 分層產生 tier。
/// tier 內以名稱升冪排序，重跑結果位元相同。One-shot 任務
/// 獨占 tier，放在其最後一個依賴所在 tier 之後。
pub fn build_plan(descriptors: &[ServiceDescriptor]) -> Result<ExecutionPlan> {
    let by_name: BTreeMap<&str, &ServiceDescriptor> = descriptors
        .iter()
        .map(|d| (d.name.as_str(), d))
        .collect();

    for (name, descriptor) in &by_name {
        for dep in &descriptor.depends_on {
            if !by_name.contains_key(dep.as_str()) {
                return Err(OrchError::UnknownDependencyError {
                    service: (*name).to_string(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    detect_cycle(&by_name)?;

    let mut placed: BTreeSet<&str> = BTreeSet::new();
    let mut tiers = Vec::new();

    while placed.len() < by_name.len() {
        let before = placed.len();

        // One-shot 先行：每個獨占一個 tier，依名稱序；
        // 放置可能解鎖依賴 one-shot 的 one-shot，所以要迭代到穩定
        loop {
            let ready: Vec<&str> = by_name
                .iter()
                .filter(|(name, d)| {
                    !placed.contains(*name)
                        && d.kind == ServiceKind::OneShot
                        && deps_placed(d, &placed)
                })
                .map(|(name, _)| *name)
                .collect();

            if ready.is_empty() {
                break;
            }

            for name in ready {
                tiers.push(Tier {
                    services: vec![name.to_string()],
                    one_shot: true,
                });
                placed.insert(name);
            }
        }

        let ready_long: Vec<&str> = by_name
            .iter()
            .filter(|(name, d)| {
                !placed.contains(*name)
                    && d.kind == ServiceKind::LongRunning
                    && deps_placed(d, &placed)
            })
            .map(|(name, _)| *name)
            .collect();

        if !ready_long.is_empty() {
            placed.extend(ready_long.iter().copied());
            tiers.push(Tier {
                services: ready_long.iter().map(|n| n.to_string()).collect(),
                one_shot: false,
            });
        }

        // 循環偵測已在前面把關，無進展不可能發生
        if placed.len() == before {
            let remaining: Vec<String> = by_name
                .keys()
                .filter(|n| !placed.contains(**n))
                .map(|n| n.to_string())
                .collect();
            return Err(OrchError::CycleDetectedError { path: remaining });
        }
    }

    Ok(ExecutionPlan { tiers })
}

fn deps_placed(descriptor: &ServiceDescriptor, placed: &BTreeSet<&str>) -> bool {
    descriptor
        .depends_on
        .iter()
        .all(|dep| placed.contains(dep.as_str()))
}

/// DFS + in-progress 集合偵測循環，回報循環路徑供診斷
fn detect_cycle(by_name: &BTreeMap<&str, &ServiceDescriptor>) -> Result<()> {
    let mut visited: HashSet<&str> = HashSet::new();
    let mut in_progress: HashSet<&str> = HashSet::new();
    let mut path: Vec<&str> = Vec::new();

    for name in by_name.keys() {
        if !visited.contains(*name) {
            visit(*name, by_name, &mut visited, &mut in_progress, &mut path)?;
        }
    }

    Ok(())
}

fn visit<'a>(
    name: &'a str,
    by_name: &BTreeMap<&'a str, &'a ServiceDescriptor>,
    visited: &mut HashSet<&'a str>,
    in_progress: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> Result<()> {
    visited.insert(name);
    in_progress.insert(name);
    path.push(name);

    let mut deps: Vec<&str> = by_name[name].depends_on.iter().map(String::as_str).collect();
    deps.sort_unstable();

    for dep in deps {
        if in_progress.contains(dep) {
            let start = path.iter().position(|n| *n == dep).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
            cycle.push(dep.to_string());
            return Err(OrchError::CycleDetectedError { path: cycle });
        }
        if !visited.contains(dep) {
            visit(dep, by_name, visited, in_progress, path)?;
        }
    }

    in_progress.remove(name);
    path.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{ReadyCheckSpec, RetryPolicy};
    use std::collections::BTreeMap as EnvMap;

    fn long_running(name: &str, deps: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            kind: ServiceKind::LongRunning,
            image: None,
            command: Some(format!("run-{}", name)),
            stop_command: None,
            ports: vec![8080],
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            env: EnvMap::new(),
            ready_check: ReadyCheckSpec::Tcp { port: 8080 },
            retry: RetryPolicy::default(),
        }
    }

    fn one_shot(name: &str, deps: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor {
            kind: ServiceKind::OneShot,
            ready_check: ReadyCheckSpec::Exit,
            ports: Vec::new(),
            ..long_running(name, deps)
        }
    }

    fn tier_names(plan: &ExecutionPlan) -> Vec<Vec<&str>> {
        plan.tiers
            .iter()
            .map(|t| t.services.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_db_migrate_api_plan() {
        let descriptors = vec![
            long_running("db", &[]),
            one_shot("migrate", &["db"]),
            long_running("api", &["migrate"]),
        ];

        let plan = build_plan(&descriptors).unwrap();
        assert_eq!(
            tier_names(&plan),
            vec![vec!["db"], vec!["migrate"], vec!["api"]]
        );
        assert!(plan.tiers[1].one_shot);
        assert!(!plan.tiers[0].one_shot);
    }

    #[test]
    fn test_dependencies_always_in_strictly_earlier_tier() {
        let descriptors = vec![
            long_running("cache", &[]),
            long_running("db", &[]),
            long_running("api", &["db", "cache"]),
            long_running("web", &["api"]),
            long_running("worker", &["db", "cache"]),
        ];

        let plan = build_plan(&descriptors).unwrap();

        let tier_of = |name: &str| {
            plan.tiers
                .iter()
                .position(|t| t.services.iter().any(|s| s == name))
                .unwrap()
        };

        for descriptor in &descriptors {
            for dep in &descriptor.depends_on {
                assert!(
                    tier_of(dep) < tier_of(&descriptor.name),
                    "{} must be in a strictly earlier tier than {}",
                    dep,
                    descriptor.name
                );
            }
        }

        // tier 內名稱升冪
        assert_eq!(tier_names(&plan)[0], vec!["cache", "db"]);
        assert_eq!(tier_names(&plan)[1], vec!["api", "worker"]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let descriptors = vec![
            long_running("b", &[]),
            long_running("a", &[]),
            one_shot("seed", &["a", "b"]),
            long_running("c", &["seed"]),
        ];

        let first = build_plan(&descriptors).unwrap();
        for _ in 0..10 {
            assert_eq!(build_plan(&descriptors).unwrap(), first);
        }
    }

    #[test]
    fn test_unknown_dependency() {
        let descriptors = vec![long_running("api", &["db"])];
        let err = build_plan(&descriptors).unwrap_err();
        match err {
            OrchError::UnknownDependencyError {
                service,
                dependency,
            } => {
                assert_eq!(service, "api");
                assert_eq!(dependency, "db");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_detected_with_path() {
        let descriptors = vec![
            long_running("a", &["c"]),
            long_running("b", &["a"]),
            long_running("c", &["b"]),
        ];

        let err = build_plan(&descriptors).unwrap_err();
        match err {
            OrchError::CycleDetectedError { path } => {
                assert!(path.len() >= 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let descriptors = vec![long_running("a", &["a"])];
        let err = build_plan(&descriptors).unwrap_err();
        match err {
            OrchError::CycleDetectedError { path } => {
                assert_eq!(path, vec!["a".to_string(), "a".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_one_shot_never_merged_with_long_running() {
        let descriptors = vec![
            long_running("db", &[]),
            one_shot("seed", &[]),
            long_running("api", &["db"]),
        ];

        let plan = build_plan(&descriptors).unwrap();
        for tier in &plan.tiers {
            if tier.one_shot {
                assert_eq!(tier.services.len(), 1);
            } else {
                assert!(tier.services.is_empty() || !tier.one_shot);
            }
        }

        // 無依賴的 one-shot 排在最前面
        assert_eq!(
            tier_names(&plan),
            vec![vec!["seed"], vec!["db"], vec!["api"]]
        );
    }

    #[test]
    fn test_sibling_one_shots_get_consecutive_singleton_tiers() {
        let descriptors = vec![
            long_running("db", &[]),
            one_shot("migrate", &["db"]),
            one_shot("fixtures", &["db"]),
            long_running("api", &["migrate", "fixtures"]),
        ];

        let plan = build_plan(&descriptors).unwrap();
        assert_eq!(
            tier_names(&plan),
            vec![vec!["db"], vec!["fixtures"], vec!["migrate"], vec!["api"]]
        );
    }

    #[test]
    fn test_one_shot_chain() {
        let descriptors = vec![
            one_shot("migrate", &[]),
            one_shot("seed", &["migrate"]),
            long_running("api", &["seed"]),
        ];

        let plan = build_plan(&descriptors).unwrap();
        assert_eq!(
            tier_names(&plan),
            vec![vec!["migrate"], vec!["seed"], vec!["api"]]
        );
    }
}
