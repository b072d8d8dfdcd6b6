use std::collections::BTreeSet;
use std::fmt::Write as FmtWrite;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("discovery listing is empty")]
    Empty,
    #[error("bad node count {0:?}")]
    BadCount(String),
    #[error("malformed entry {0:?}")]
    MalformedEntry(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub name: String,
    pub short_name: String,
    pub addr: Ipv4Addr,
}

/// Sensor nodes known for one poll cycle. Replaced wholesale every tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    nodes: Vec<NodeEntry>,
}

impl Inventory {
    pub fn nodes(&self) -> &[NodeEntry] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn names(&self) -> BTreeSet<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    pub fn same_names(&self, other: &Inventory) -> bool {
        self.names() == other.names()
    }

    /// Text for the dashboard terminal pane.
    pub fn listing(&self) -> String {
        let mut out = String::with_capacity(self.nodes.len() * 32);
        let _ = writeln!(out, "{} node(s)", self.nodes.len());
        for node in &self.nodes {
            let _ = writeln!(out, "{:<8} {:<8} {}", node.name, node.short_name, node.addr);
        }
        out
    }
}

fn parse_entry(entry: &str) -> Result<NodeEntry, DiscoveryError> {
    let malformed = || DiscoveryError::MalformedEntry(entry.to_string());

    let (name, rest) = entry.split_once(',').ok_or_else(malformed)?;
    let (short_name, addr) = rest.split_once(':').ok_or_else(malformed)?;
    let addr: Ipv4Addr = addr.trim().parse().map_err(|_| malformed())?;

    if name.trim().is_empty() {
        return Err(malformed());
    }

    Ok(NodeEntry {
        name: name.trim().to_string(),
        short_name: short_name.trim().to_string(),
        addr,
    })
}

/// Parses `count "|" (name "," shortName ":" ipv4 "|")*`.
///
/// `count` is authoritative: parsing stops after that many entries even if
/// the body carries more, and a short body yields only what it has. Names are
/// unique in the result.
pub fn parse_listing(body: &str) -> Result<Inventory, DiscoveryError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(DiscoveryError::Empty);
    }

    let mut fields = body.split('|');
    let count_field = fields.next().unwrap_or_default().trim();
    let count: usize = count_field
        .parse()
        .map_err(|_| DiscoveryError::BadCount(count_field.to_string()))?;

    let mut nodes: Vec<NodeEntry> = Vec::with_capacity(count.min(16));
    for field in fields.map(str::trim).filter(|f| !f.is_empty()).take(count) {
        let entry = parse_entry(field)?;
        // One entry per name; a repeated name takes the later address.
        match nodes.iter_mut().find(|n| n.name == entry.name) {
            Some(existing) => *existing = entry,
            None => nodes.push(entry),
        }
    }

    Ok(Inventory { nodes })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_node_listing() {
        let inventory = parse_listing("1|2,BME:192.168.1.8|\n").unwrap();

        assert_eq!(inventory.len(), 1);
        assert_eq!(
            inventory.nodes()[0],
            NodeEntry {
                name: "2".to_string(),
                short_name: "BME".to_string(),
                addr: Ipv4Addr::new(192, 168, 1, 8),
            }
        );
    }

    #[test]
    fn count_is_authoritative() {
        let body = "2|ROOM1,BME:192.168.1.181|ROOM2,SHT:192.168.1.182|CLNT,ADC:192.168.1.179|";
        let inventory = parse_listing(body).unwrap();
        assert_eq!(inventory.len(), 2);
        assert_eq!(inventory.nodes()[1].name, "ROOM2");

        let short = parse_listing("3|ROOM1,BME:192.168.1.181|").unwrap();
        assert_eq!(short.len(), 1);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_listing("  \n"), Err(DiscoveryError::Empty));
        assert!(matches!(parse_listing("x|a,b:1.2.3.4|"), Err(DiscoveryError::BadCount(_))));
        assert!(matches!(
            parse_listing("1|a,b:999.2.3.4|"),
            Err(DiscoveryError::MalformedEntry(_))
        ));
        assert!(matches!(parse_listing("1|a-b-1.2.3.4|"), Err(DiscoveryError::MalformedEntry(_))));
    }

    #[test]
    fn repeated_name_keeps_the_last_address() {
        let inventory = parse_listing("2|A,x:10.0.0.1|A,y:10.0.0.2|").unwrap();

        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory.nodes()[0].short_name, "y");
        assert_eq!(inventory.nodes()[0].addr, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn zero_count_is_an_empty_inventory() {
        assert!(parse_listing("0|").unwrap().is_empty());
    }

    #[test]
    fn name_set_comparison_ignores_order_and_addresses() {
        let a = parse_listing("2|A,x:10.0.0.1|B,y:10.0.0.2|").unwrap();
        let b = parse_listing("2|B,y:10.0.0.9|A,x:10.0.0.1|").unwrap();
        let c = parse_listing("1|A,x:10.0.0.1|").unwrap();

        assert!(a.same_names(&b));
        assert!(!a.same_names(&c));
        assert!(a.listing().contains("10.0.0.2"));
    }
}
