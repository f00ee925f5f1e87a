//! CRD YAML Generator
//!
//! This binary generates the Kubernetes CRD manifests for the custom
//! resources defined by the redis-backup-operator.
//!
//! Usage: cargo run --bin crdgen > deploy/crds/all.yaml

use redis_backup_operator::crd::generate_crds;

fn main() {
    for crd in generate_crds() {
        println!("---");
        print!("{}", crd);
    }
}
