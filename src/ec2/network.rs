//! EC2 network provisioning: VPC, gateways, route tables, subnets, security groups.

use std::collections::HashMap;

use anyhow::Result;
use aws_sdk_ec2::Client;
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{
    AttributeBooleanValue, DomainType, Filter, IpPermission, IpRange, ResourceType, Tag,
    TagSpecification,
};
use tracing::{debug, info};

use crate::cloud::SubnetRequest;
use crate::error::DpoError;

const DEFAULT_ROUTE: &str = "0.0.0.0/0";

fn tag_spec(resource: ResourceType, name: &str, tags: &HashMap<String, String>) -> TagSpecification {
    let mut builder = TagSpecification::builder()
        .resource_type(resource)
        .tags(Tag::builder().key("Name").value(name).build());
    for (key, value) in tags {
        builder = builder.tags(Tag::builder().key(key).value(value).build());
    }
    builder.build()
}

fn enabled() -> AttributeBooleanValue {
    AttributeBooleanValue::builder().value(true).build()
}

/// Create a VPC. Returns the VPC id.
pub async fn create_vpc(
    client: &Client,
    name: &str,
    cidr: &str,
    tags: &HashMap<String, String>,
) -> Result<String> {
    info!("Creating VPC {} ({})", name, cidr);

    let response = client
        .create_vpc()
        .cidr_block(cidr)
        .tag_specifications(tag_spec(ResourceType::Vpc, name, tags))
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    response
        .vpc()
        .and_then(|v| v.vpc_id())
        .map(str::to_string)
        .ok_or_else(|| DpoError::missing(module_path!(), "vpc.vpc_id").into())
}

pub async fn enable_dns_hostnames(client: &Client, vpc_id: &str) -> Result<()> {
    client
        .modify_vpc_attribute()
        .vpc_id(vpc_id)
        .enable_dns_hostnames(enabled())
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;
    Ok(())
}

pub async fn create_internet_gateway(
    client: &Client,
    name: &str,
    tags: &HashMap<String, String>,
) -> Result<String> {
    info!("Creating internet gateway {}", name);

    let response = client
        .create_internet_gateway()
        .tag_specifications(tag_spec(ResourceType::InternetGateway, name, tags))
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    response
        .internet_gateway()
        .and_then(|g| g.internet_gateway_id())
        .map(str::to_string)
        .ok_or_else(|| DpoError::missing(module_path!(), "internet_gateway_id").into())
}

/// Attach the gateway to `vpc_id`. An existing attachment counts as success.
pub async fn attach_internet_gateway(
    client: &Client,
    internet_gateway_id: &str,
    vpc_id: &str,
) -> Result<()> {
    match client
        .attach_internet_gateway()
        .internet_gateway_id(internet_gateway_id)
        .vpc_id(vpc_id)
        .send()
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some("Resource.AlreadyAssociated") => {
            debug!("{} already attached to {}", internet_gateway_id, vpc_id);
            Ok(())
        }
        Err(e) => Err(DpoError::aws(module_path!(), e).into()),
    }
}

pub async fn create_route_table(
    client: &Client,
    name: &str,
    vpc_id: &str,
    tags: &HashMap<String, String>,
) -> Result<String> {
    info!("Creating route table {} in {}", name, vpc_id);

    let response = client
        .create_route_table()
        .vpc_id(vpc_id)
        .tag_specifications(tag_spec(ResourceType::RouteTable, name, tags))
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    response
        .route_table()
        .and_then(|rt| rt.route_table_id())
        .map(str::to_string)
        .ok_or_else(|| DpoError::missing(module_path!(), "route_table_id").into())
}

/// Send the default route of `route_table_id` through the internet gateway.
pub async fn add_internet_route(
    client: &Client,
    route_table_id: &str,
    internet_gateway_id: &str,
) -> Result<()> {
    match client
        .create_route()
        .route_table_id(route_table_id)
        .destination_cidr_block(DEFAULT_ROUTE)
        .gateway_id(internet_gateway_id)
        .send()
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some("RouteAlreadyExists") => {
            debug!("Default route of {} already present", route_table_id);
            Ok(())
        }
        Err(e) => Err(DpoError::aws(module_path!(), e).into()),
    }
}

/// Availability zones currently available in the region, sorted by name.
pub async fn availability_zones(client: &Client) -> Result<Vec<String>> {
    let response = client
        .describe_availability_zones()
        .filters(Filter::builder().name("state").values("available").build())
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    let mut zones: Vec<String> = response
        .availability_zones()
        .iter()
        .filter_map(|az| az.zone_name().map(str::to_string))
        .collect();
    zones.sort();

    debug!("Found {} availability zones", zones.len());
    Ok(zones)
}

/// Create one subnet tagged for load balancer discovery.
pub async fn create_subnet(
    client: &Client,
    request: &SubnetRequest,
    tags: &HashMap<String, String>,
) -> Result<String> {
    info!(
        "Creating {} subnet {} ({}) in {}",
        if request.public { "public" } else { "private" },
        request.name,
        request.cidr,
        request.availability_zone
    );

    let mut subnet_tags = tags.clone();
    let elb_role = if request.public {
        "kubernetes.io/role/elb"
    } else {
        "kubernetes.io/role/internal-elb"
    };
    subnet_tags.insert(elb_role.to_string(), "1".to_string());
    subnet_tags.insert(
        format!("kubernetes.io/cluster/{}", request.cluster_name),
        "shared".to_string(),
    );

    let response = client
        .create_subnet()
        .vpc_id(&request.vpc_id)
        .cidr_block(&request.cidr)
        .availability_zone(&request.availability_zone)
        .tag_specifications(tag_spec(ResourceType::Subnet, &request.name, &subnet_tags))
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    response
        .subnet()
        .and_then(|s| s.subnet_id())
        .map(str::to_string)
        .ok_or_else(|| DpoError::missing(module_path!(), "subnet_id").into())
}

/// Map public IPs on launch and join the public route table.
///
/// Both calls are safe to repeat; an existing association counts as success.
pub async fn configure_public_subnet(
    client: &Client,
    subnet_id: &str,
    route_table_id: &str,
) -> Result<()> {
    client
        .modify_subnet_attribute()
        .subnet_id(subnet_id)
        .map_public_ip_on_launch(enabled())
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    match client
        .associate_route_table()
        .route_table_id(route_table_id)
        .subnet_id(subnet_id)
        .send()
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some("Resource.AlreadyAssociated") => {
            debug!("{} already associated with {}", subnet_id, route_table_id);
            Ok(())
        }
        Err(e) => Err(DpoError::aws(module_path!(), e).into()),
    }
}

pub async fn create_security_group(
    client: &Client,
    name: &str,
    vpc_id: &str,
    tags: &HashMap<String, String>,
) -> Result<String> {
    info!("Creating security group {} in {}", name, vpc_id);

    let response = client
        .create_security_group()
        .group_name(name)
        .description(format!("Cluster security group for {name}"))
        .vpc_id(vpc_id)
        .tag_specifications(tag_spec(ResourceType::SecurityGroup, name, tags))
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    response
        .group_id()
        .map(str::to_string)
        .ok_or_else(|| DpoError::missing(module_path!(), "group_id").into())
}

/// Allow all protocols from `cidr`. An existing identical rule counts as success.
pub async fn authorize_ingress(client: &Client, security_group_id: &str, cidr: &str) -> Result<()> {
    let permission = IpPermission::builder()
        .ip_protocol("-1")
        .ip_ranges(IpRange::builder().cidr_ip(cidr).build())
        .build();

    match client
        .authorize_security_group_ingress()
        .group_id(security_group_id)
        .ip_permissions(permission)
        .send()
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if e.code() == Some("InvalidPermission.Duplicate") => {
            debug!("Ingress rule from {} already present on {}", cidr, security_group_id);
            Ok(())
        }
        Err(e) => Err(DpoError::aws(module_path!(), e).into()),
    }
}

/// Allocate an elastic IP for a NAT gateway. Returns the allocation id.
pub async fn allocate_address(
    client: &Client,
    name: &str,
    tags: &HashMap<String, String>,
) -> Result<String> {
    info!("Allocating elastic IP {}", name);

    let address = client
        .allocate_address()
        .domain(DomainType::Vpc)
        .tag_specifications(tag_spec(ResourceType::ElasticIp, name, tags))
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    address
        .allocation_id()
        .map(str::to_string)
        .ok_or_else(|| DpoError::missing(module_path!(), "allocation_id").into())
}

pub async fn create_nat_gateway(
    client: &Client,
    name: &str,
    subnet_id: &str,
    allocation_id: &str,
    tags: &HashMap<String, String>,
) -> Result<String> {
    info!("Creating NAT gateway {} in {}", name, subnet_id);

    let response = client
        .create_nat_gateway()
        .subnet_id(subnet_id)
        .allocation_id(allocation_id)
        .tag_specifications(tag_spec(ResourceType::Natgateway, name, tags))
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    response
        .nat_gateway()
        .and_then(|n| n.nat_gateway_id())
        .map(str::to_string)
        .ok_or_else(|| DpoError::missing(module_path!(), "nat_gateway_id").into())
}

/// Point the default route of every non-public route table in the VPC at the NAT gateway.
pub async fn route_private_tables_via_nat(
    client: &Client,
    vpc_id: &str,
    public_route_table_id: &str,
    nat_gateway_id: &str,
) -> Result<usize> {
    let response = client
        .describe_route_tables()
        .filters(Filter::builder().name("vpc-id").values(vpc_id).build())
        .send()
        .await
        .map_err(|e| DpoError::aws(module_path!(), e))?;

    let private_tables: Vec<String> = response
        .route_tables()
        .iter()
        .filter_map(|rt| rt.route_table_id())
        .filter(|id| *id != public_route_table_id)
        .map(str::to_string)
        .collect();

    for route_table_id in &private_tables {
        let created = client
            .create_route()
            .route_table_id(route_table_id)
            .destination_cidr_block(DEFAULT_ROUTE)
            .nat_gateway_id(nat_gateway_id)
            .send()
            .await;

        match created {
            Ok(_) => {}
            Err(e) if e.code() == Some("RouteAlreadyExists") => {
                client
                    .replace_route()
                    .route_table_id(route_table_id)
                    .destination_cidr_block(DEFAULT_ROUTE)
                    .nat_gateway_id(nat_gateway_id)
                    .send()
                    .await
                    .map_err(|e| DpoError::aws(module_path!(), e))?;
            }
            Err(e) => return Err(DpoError::aws(module_path!(), e).into()),
        }
        debug!("Routed {} through {}", route_table_id, nat_gateway_id);
    }

    Ok(private_tables.len())
}
