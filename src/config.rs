//! Parsing for the two configuration files every peer process reads from its
//! working directory: `Common.cfg` and `PeerInfo.cfg`.

use std::{fs, path::Path};

use crate::{
    error::{ConfigError, Result},
    PeerId,
};

/// The six recognized `Common.cfg` keys. Any other key is a fatal
/// configuration error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommonConf {
    /// `k` in the choke scheduler: how many preferred neighbors to keep
    /// unchoked at once.
    pub num_preferred_neighbors: usize,
    /// Regular unchoke period, in seconds. Also drives the request timeout
    /// (`4 * unchoking_interval`).
    pub unchoking_interval: u64,
    /// Optimistic unchoke period, in seconds.
    pub optimistic_unchoking_interval: u64,
    /// The name of the file being shared.
    pub file_name: String,
    /// Total size of the shared file, in bytes.
    pub file_size: u64,
    /// Size of a single piece, in bytes. The last piece may be shorter.
    pub piece_size: u32,
}

impl CommonConf {
    /// Parses `Common.cfg`'s contents.
    ///
    /// The format is whitespace-separated `key value` pairs, one per line,
    /// in any order; blank lines are allowed. Any key outside the six
    /// recognized ones is a fatal error, as is a missing key.
    pub fn parse(contents: &str) -> Result<Self> {
        let mut num_preferred_neighbors = None;
        let mut unchoking_interval = None;
        let mut optimistic_unchoking_interval = None;
        let mut file_name = None;
        let mut file_size = None;
        let mut piece_size = None;

        for line in contents.lines() {
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            if words.len() != 2 {
                return Err(ConfigError::MalformedLine {
                    file: "Common.cfg",
                    line: line.to_owned(),
                }
                .into());
            }
            let (key, val) = (words[0], words[1]);
            match key {
                "NumberOfPreferredNeighbors" => {
                    num_preferred_neighbors = Some(parse_int(key, val)?);
                }
                "UnchokingInterval" => {
                    unchoking_interval = Some(parse_int(key, val)?);
                }
                "OptimisticUnchokingInterval" => {
                    optimistic_unchoking_interval = Some(parse_int(key, val)?);
                }
                "FileName" => file_name = Some(val.to_owned()),
                "FileSize" => file_size = Some(parse_int(key, val)?),
                "PieceSize" => piece_size = Some(parse_int(key, val)?),
                other => {
                    return Err(
                        ConfigError::UnknownKey(other.to_owned()).into()
                    )
                }
            }
        }

        Ok(Self {
            num_preferred_neighbors: num_preferred_neighbors
                .ok_or(ConfigError::MissingKey("NumberOfPreferredNeighbors"))?
                as usize,
            unchoking_interval: unchoking_interval
                .ok_or(ConfigError::MissingKey("UnchokingInterval"))?,
            optimistic_unchoking_interval: optimistic_unchoking_interval
                .ok_or(ConfigError::MissingKey(
                    "OptimisticUnchokingInterval",
                ))?,
            file_name: file_name
                .ok_or(ConfigError::MissingKey("FileName"))?,
            file_size: file_size
                .ok_or(ConfigError::MissingKey("FileSize"))?,
            piece_size: piece_size
                .ok_or(ConfigError::MissingKey("PieceSize"))?
                as u32,
        })
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// The request timeout, `4 * UnchokingInterval` seconds (see the
    /// Request Manager).
    pub fn request_timeout_secs(&self) -> u64 {
        4 * self.unchoking_interval
    }
}

fn parse_int<T: std::str::FromStr>(key: &'static str, val: &str) -> Result<T> {
    val.parse().map_err(|_| {
        ConfigError::InvalidInt {
            key,
            value: val.to_owned(),
        }
        .into()
    })
}

/// One line of `PeerInfo.cfg`: `peer_id host port has_file_flag`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub host: String,
    pub port: u16,
    pub has_file: bool,
}

/// The full cohort as listed in `PeerInfo.cfg`, in file order. Order defines
/// the dial/accept partitioning: peers listed above a given id are dialed
/// outbound ("prior"), peers listed below are accepted inbound in listed
/// order ("later").
#[derive(Clone, Debug)]
pub struct Cohort {
    peers: Vec<PeerInfo>,
}

impl Cohort {
    pub fn parse(contents: &str) -> Result<Self> {
        let mut peers = Vec::new();
        for line in contents.lines() {
            let words: Vec<&str> = line.split_whitespace().collect();
            if words.is_empty() {
                continue;
            }
            if words.len() != 4 {
                return Err(ConfigError::MalformedLine {
                    file: "PeerInfo.cfg",
                    line: line.to_owned(),
                }
                .into());
            }
            let id: PeerId = words[0].parse().map_err(|_| {
                ConfigError::InvalidInt {
                    key: "peer_id",
                    value: words[0].to_owned(),
                }
            })?;
            let port: u16 = words[2].parse().map_err(|_| {
                ConfigError::InvalidInt {
                    key: "port",
                    value: words[2].to_owned(),
                }
            })?;
            let has_file = words[3] == "1";
            peers.push(PeerInfo {
                id,
                host: words[1].to_owned(),
                port,
                has_file,
            });
        }
        Ok(Self { peers })
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// The number of peers in the cohort, including the local peer.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Returns the record for `id`, or `None` if it isn't listed.
    pub fn get(&self, id: PeerId) -> Option<&PeerInfo> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Peers listed above `id`: to be dialed outbound.
    pub fn prior(&self, id: PeerId) -> Result<Vec<&PeerInfo>> {
        let pos = self.position(id)?;
        Ok(self.peers[..pos].iter().collect())
    }

    /// Peers listed below `id`, in listed order: to be accepted inbound.
    pub fn later(&self, id: PeerId) -> Result<Vec<&PeerInfo>> {
        let pos = self.position(id)?;
        Ok(self.peers[pos + 1..].iter().collect())
    }

    fn position(&self, id: PeerId) -> Result<usize> {
        self.peers
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| ConfigError::UnknownPeerId(id).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_common_cfg() {
        let text = "NumberOfPreferredNeighbors 2\nUnchokingInterval 5\n\
                     OptimisticUnchokingInterval 15\nFileName thefile.dat\n\
                     FileSize 2167705\nPieceSize 16384\n";
        let conf = CommonConf::parse(text).unwrap();
        assert_eq!(conf.num_preferred_neighbors, 2);
        assert_eq!(conf.unchoking_interval, 5);
        assert_eq!(conf.optimistic_unchoking_interval, 15);
        assert_eq!(conf.file_name, "thefile.dat");
        assert_eq!(conf.file_size, 2167705);
        assert_eq!(conf.piece_size, 16384);
        assert_eq!(conf.request_timeout_secs(), 20);
    }

    #[test]
    fn unknown_key_is_fatal() {
        let text = "NumberOfPreferredNeighbors 2\nBogusKey 1\n";
        assert!(matches!(
            CommonConf::parse(text),
            Err(crate::error::Error::Config(ConfigError::UnknownKey(_)))
        ));
    }

    #[test]
    fn missing_key_is_fatal() {
        let text = "NumberOfPreferredNeighbors 2\n";
        assert!(matches!(
            CommonConf::parse(text),
            Err(crate::error::Error::Config(ConfigError::MissingKey(_)))
        ));
    }

    #[test]
    fn cohort_partitions_prior_and_later() {
        let text = "1001 host1 6001 1\n1002 host2 6002 0\n1003 host3 6003 0\n";
        let cohort = Cohort::parse(text).unwrap();
        assert_eq!(cohort.len(), 3);
        let prior = cohort.prior(1002).unwrap();
        assert_eq!(prior.len(), 1);
        assert_eq!(prior[0].id, 1001);
        let later = cohort.later(1002).unwrap();
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].id, 1003);
    }

    #[test]
    fn unknown_peer_id_is_fatal() {
        let text = "1001 host1 6001 1\n";
        let cohort = Cohort::parse(text).unwrap();
        assert!(matches!(
            cohort.prior(9999),
            Err(crate::error::Error::Config(
                ConfigError::UnknownPeerId(9999)
            ))
        ));
    }
}
