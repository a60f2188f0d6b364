//! Peer-address persistence: `peers.dat` (binary) and `peers.csv` (text).

use crate::error::StorageError;
use crate::network::codec::{ByteReader, ByteWriter};
use crate::network::message::{AddressRecord, NetworkAddress};
use std::fs;
use std::io::Write;
use std::path::Path;

/// timestamp u32 + services u64 + ip 16 + port u16.
pub const PEER_RECORD_LEN: usize = 30;

/// `peers.dat`: a `u32` record count followed by that many binary records.
pub fn save_peer_addresses(path: &Path, records: &[AddressRecord]) -> Result<(), StorageError> {
    let mut w = ByteWriter::new();
    w.put_u32_le(records.len() as u32);
    for record in records {
        w.put_u32_le(record.timestamp);
        w.put_u64_le(record.address.services);
        w.put(&record.address.ip);
        w.put_u16_be(record.address.port);
    }
    fs::write(path, w.into_bytes())?;
    log::info!("saved {} peers to {}", records.len(), path.display());
    Ok(())
}

pub fn load_peer_addresses(path: &Path) -> Result<Vec<AddressRecord>, StorageError> {
    let bytes = fs::read(path)?;
    let mut r = ByteReader::new(&bytes);
    let count = r
        .read_u32_le()
        .map_err(|_| StorageError::Corrupt("peer count"))?;
    if bytes.len() != 4 + count as usize * PEER_RECORD_LEN {
        return Err(StorageError::Corrupt("peer file length"));
    }

    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let timestamp = r.read_u32_le().map_err(|_| StorageError::Corrupt("peer record"))?;
        let services = r.read_u64_le().map_err(|_| StorageError::Corrupt("peer record"))?;
        let ip: [u8; 16] = r
            .read(16)
            .map_err(|_| StorageError::Corrupt("peer record"))?
            .try_into()
            .unwrap();
        let port = r.read_u16_be().map_err(|_| StorageError::Corrupt("peer record"))?;
        records.push(AddressRecord {
            timestamp,
            address: NetworkAddress { services, ip, port },
        });
    }
    log::info!("loaded {} peers from {}", records.len(), path.display());
    Ok(records)
}

/// `peers.csv`: one `timestamp,ip,port,services` line per record.
pub fn export_peer_addresses_csv(
    path: &Path,
    records: &[AddressRecord],
) -> Result<(), StorageError> {
    let mut file = fs::File::create(path)?;
    for record in records {
        writeln!(
            file,
            "{},{},{},{}",
            record.timestamp,
            record.address.socket_addr().ip(),
            record.address.port,
            record.address.services,
        )?;
    }
    Ok(())
}
