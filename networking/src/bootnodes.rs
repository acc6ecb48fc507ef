use std::fs::File;

use libp2p::Multiaddr;
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct StaticBootnodes(Vec<Multiaddr>);

impl StaticBootnodes {
    /// Builds the bootnode list from command line values.
    ///
    /// Each value is either a multiaddr or a path to a YAML file holding a
    /// list of multiaddrs. Unusable values are logged and skipped.
    pub fn from_arguments<S: AsRef<str>>(arguments: &[S]) -> Self {
        StaticBootnodes(
            arguments
                .iter()
                .flat_map(|arg| parse_bootnode_argument(arg.as_ref()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_multiaddrs(&self) -> Vec<Multiaddr> {
        self.0.clone()
    }
}

fn parse_bootnode_argument(arg: &str) -> Vec<Multiaddr> {
    if let Ok(addr) = arg.parse::<Multiaddr>() {
        return vec![addr];
    }

    let Ok(file) = File::open(arg) else {
        warn!(
            "value {arg:?} provided as bootnode is not recognized - it is not valid multiaddr nor valid path to file containing bootnodes."
        );

        return Vec::new();
    };

    let entries: Vec<String> = match serde_yaml::from_reader(file) {
        Ok(value) => value,
        Err(err) => {
            warn!("failed to read bootnodes from {arg:?}: {err:?}");

            return Vec::new();
        }
    };

    if entries.is_empty() {
        warn!("provided file with bootnodes {arg:?} is empty");
    }

    entries
        .iter()
        .filter_map(|entry| match entry.parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(err) => {
                warn!("skipping bootnode {entry:?} from {arg:?}: {err}");
                None
            }
        })
        .collect()
}
