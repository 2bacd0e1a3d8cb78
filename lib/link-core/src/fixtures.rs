//! Inventory builders shared by unit tests

use link_api::v1alpha1::{Cluster, ClusterNode, ClusterNodeSpec, ClusterSpec, IpFamily, NetworkType, ROLE_GATEWAY};

pub fn cluster(name: &str) -> Cluster {
    Cluster::new(name, ClusterSpec::default())
}

pub fn ipv4_cluster(name: &str, network_type: NetworkType) -> Cluster {
    let mut cluster = cluster(name);
    cluster.spec.ip_family = IpFamily::Ipv4;
    cluster.spec.network_type = network_type;
    cluster
}

pub fn node(cluster: &str, name: &str, ip: &str, pod_cidrs: &[&str]) -> ClusterNode {
    ClusterNode::new(
        &format!("{}-{}", cluster, name),
        ClusterNodeSpec {
            cluster_name: cluster.to_string(),
            node_name: name.to_string(),
            roles: vec!["worker".to_string()],
            interface_name: "eth0".to_string(),
            ip: ip.to_string(),
            ip6: String::new(),
            pod_cidrs: pod_cidrs.iter().map(|c| c.to_string()).collect(),
        },
    )
}

pub fn gateway(cluster: &str, name: &str, ip: &str, pod_cidrs: &[&str]) -> ClusterNode {
    let mut node = node(cluster, name, ip, pod_cidrs);
    node.spec.roles.push(ROLE_GATEWAY.to_string());
    node
}

pub fn dual_stack(cluster: &str, name: &str, ip: &str, ip6: &str, pod_cidrs: &[&str]) -> ClusterNode {
    let mut node = node(cluster, name, ip, pod_cidrs);
    node.spec.ip6 = ip6.to_string();
    node
}
