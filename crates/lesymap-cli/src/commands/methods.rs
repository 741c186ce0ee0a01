//! `lesymap methods`: list the available mapping methods.

use lesymap_core::Method;

fn flag(on: bool) -> &'static str {
    if on { "yes" } else { "-" }
}

pub fn run(json: bool) {
    if json {
        let infos: Vec<_> = Method::ALL.iter().map(|m| m.info()).collect();
        if let Err(e) = super::write_json(&infos, None) {
            super::fail(e);
        }
        return;
    }

    println!(
        "{:<12} {:<8} {:<8} {:<10} {:<8} Description",
        "Method", "Perm", "Binary", "Covariates", "P-values"
    );
    println!("{}", "-".repeat(90));
    for method in Method::ALL {
        let info = method.info();
        println!(
            "{:<12} {:<8} {:<8} {:<10} {:<8} {}",
            info.name,
            flag(info.permutation_correction),
            flag(info.binary_behavior),
            flag(info.covariates),
            flag(info.p_values),
            info.description
        );
    }
    println!();
    println!("Perm: FWERperm and clusterPerm corrections are available.");
}
