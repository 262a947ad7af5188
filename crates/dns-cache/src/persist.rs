//! The disk cache.  On shutdown the cache is written to a single
//! file; on startup it is read back, so a restart does not start
//! cold.
//!
//! The file begins with a 4-byte version tag.  A mismatch means the
//! format changed: the file is ignored and the cache starts empty.
//! All integers are big-endian.  Layout per entry:
//!
//! ```text
//! qlen u8 | num_rrs u8 | flags u16 | c_ns u8 | c_soa u8
//! [ttl u32 | ts u64]           -- negative entries only
//! name                         -- qlen octets, length-prefixed labels
//! num_rrs * rr-set records, in strictly ascending type order:
//!   type u8 | num_rr u8 | flags u16 | ttl u32 | ts u64
//!   num_rr * (rdlen u16 | rdata)
//! ```
//!
//! Local data is configuration, not cache, and is not persisted: a
//! cent containing nothing but local sets is skipped entirely.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use dns_types::protocol::types::{DomainName, Label, RecordType, RecordTypeWithData};

use crate::entry::{Cent, NegInfo, RrSet, DF_LOCAL, DF_NEGATIVE};
use crate::store::Cache;

/// Bumped whenever the layout (or byte order) changes.
pub const CACHE_VERSION: [u8; 4] = *b"RLY1";

/// File name inside the cache directory.
pub const CACHE_FILE_NAME: &str = "relayed.cache";

/// Marker for an undefined `c_ns`/`c_soa` hop count.
const HINT_UNDEF: u8 = 0xff;

/// Errors encountered reading a cache file.
#[derive(Debug)]
pub enum Error {
    IO(io::Error),
    /// The version tag does not match: the file is from another
    /// version (or is not a cache file at all).
    BadVersion([u8; 4]),
    /// The file ends in the middle of an item.
    Truncated(&'static str),
    /// A value in the file makes no sense.
    Malformed(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IO(error) => write!(f, "i/o error: {error}"),
            Error::BadVersion(tag) => write!(f, "unknown cache file version tag {tag:?}"),
            Error::Truncated(what) => write!(f, "cache file ends inside {what}"),
            Error::Malformed(what) => write!(f, "cache file has malformed {what}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IO(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::IO(error)
    }
}

/// Read a cache file into the store.  Returns the number of entries
/// loaded.  Entries go through the normal insertion path, so TTL
/// clamping and purge ordering apply just as for fresh data.
pub fn load(reader: &mut dyn Read, cache: &mut Cache, now: u64) -> Result<usize, Error> {
    let mut tag = [0u8; 4];
    reader
        .read_exact(&mut tag)
        .map_err(|_| Error::Truncated("version tag"))?;
    if tag != CACHE_VERSION {
        return Err(Error::BadVersion(tag));
    }

    let count = read_u32(reader, "entry count")?;
    for _ in 0..count {
        let cent = read_cent(reader)?;
        cache.add_cache(cent, now);
    }

    Ok(count as usize)
}

/// Write the persistable part of the cache.  Returns the number of
/// entries written.
pub fn save(writer: &mut dyn Write, cache: &Cache) -> io::Result<usize> {
    let persistable: Vec<&Cent> = cache.iter().filter(|cent| is_persistable(cent)).collect();

    writer.write_all(&CACHE_VERSION)?;
    writer.write_all(&u32::try_from(persistable.len()).unwrap_or(u32::MAX).to_be_bytes())?;

    let mut written = 0;
    for cent in persistable {
        if written == u32::MAX as usize {
            break;
        }
        write_cent(writer, cent)?;
        written += 1;
    }

    Ok(written)
}

/// Read `<cache_dir>/relayed.cache` if it exists.  A missing file is
/// a cold start, not an error.
pub fn load_dir(cache_dir: &Path, cache: &mut Cache, now: u64) -> Result<usize, Error> {
    let path = cache_dir.join(CACHE_FILE_NAME);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(error) => return Err(Error::IO(error)),
    };
    load(&mut BufReader::new(file), cache, now)
}

/// Write `<cache_dir>/relayed.cache`, atomically via a temporary
/// file.
pub fn save_dir(cache_dir: &Path, cache: &Cache) -> io::Result<usize> {
    let tmp_path = cache_dir.join(format!("{CACHE_FILE_NAME}.tmp"));
    let final_path = cache_dir.join(CACHE_FILE_NAME);

    let mut writer = BufWriter::new(File::create(&tmp_path)?);
    let written = save(&mut writer, cache)?;
    writer.flush()?;
    drop(writer);

    std::fs::rename(&tmp_path, &final_path)?;
    Ok(written)
}

fn is_persistable(cent: &Cent) -> bool {
    if cent.is_negative() {
        cent.flags & DF_LOCAL == 0
    } else {
        cent.rrsets().any(|(_, rrs)| !rrs.is_local())
    }
}

fn write_cent(writer: &mut dyn Write, cent: &Cent) -> io::Result<()> {
    let sets: Vec<(RecordType, &RrSet)> = cent
        .rrsets()
        .filter(|(_, rrs)| !rrs.is_local())
        .collect();

    writer.write_all(&[
        u8::try_from(cent.name.len).unwrap_or(u8::MAX),
        u8::try_from(sets.len()).unwrap_or(u8::MAX),
    ])?;
    writer.write_all(&cent.flags.to_be_bytes())?;
    writer.write_all(&[
        cent.c_ns.unwrap_or(HINT_UNDEF),
        cent.c_soa.unwrap_or(HINT_UNDEF),
    ])?;

    if cent.is_negative() {
        let neg = cent.neg.unwrap_or(NegInfo { ttl: 0, ts: 0 });
        writer.write_all(&neg.ttl.to_be_bytes())?;
        writer.write_all(&neg.ts.to_be_bytes())?;
    }

    for label in &cent.name.labels {
        writer.write_all(&[label.len()])?;
        writer.write_all(label.octets())?;
    }

    for (rtype, rrs) in sets {
        // type numbers of cacheable types all fit a u8
        let tp = u8::try_from(u16::from(rtype)).unwrap_or(u8::MAX);
        let num_rr = rrs.records.len().min(255);
        writer.write_all(&[tp, num_rr as u8])?;
        writer.write_all(&rrs.flags.to_be_bytes())?;
        writer.write_all(&rrs.ttl.to_be_bytes())?;
        writer.write_all(&rrs.ts.to_be_bytes())?;

        for record in rrs.records.iter().take(num_rr) {
            let rdata = record.to_standalone_rdata();
            writer.write_all(&u16::try_from(rdata.len()).unwrap_or(u16::MAX).to_be_bytes())?;
            writer.write_all(&rdata)?;
        }
    }

    Ok(())
}

fn read_cent(reader: &mut dyn Read) -> Result<Cent, Error> {
    let qlen = read_u8(reader, "entry header")?;
    let num_rrs = read_u8(reader, "entry header")?;
    let flags = read_u16(reader, "entry header")?;
    let c_ns = read_u8(reader, "entry header")?;
    let c_soa = read_u8(reader, "entry header")?;

    let neg = if flags & DF_NEGATIVE != 0 {
        let ttl = read_u32(reader, "negative entry ttl")?;
        let ts = read_u64(reader, "negative entry timestamp")?;
        Some(NegInfo { ttl, ts })
    } else {
        None
    };

    let name = read_name(reader, qlen)?;

    let mut cent = if let Some(neg) = neg {
        if num_rrs != 0 {
            return Err(Error::Malformed("negative entry with RR sets"));
        }
        Cent::new_negative(name, neg.ttl, neg.ts, flags)
    } else {
        Cent::new(name, flags)
    };
    cent.c_ns = (c_ns != HINT_UNDEF).then_some(c_ns);
    cent.c_soa = (c_soa != HINT_UNDEF).then_some(c_soa);

    let mut last_type: Option<u8> = None;
    for _ in 0..num_rrs {
        let tp = read_u8(reader, "RR set header")?;
        if last_type.map_or(false, |last| last >= tp) {
            return Err(Error::Malformed("RR set type order"));
        }
        last_type = Some(tp);

        let num_rr = read_u8(reader, "RR set header")?;
        let set_flags = read_u16(reader, "RR set header")?;
        let ttl = read_u32(reader, "RR set header")?;
        let ts = read_u64(reader, "RR set header")?;

        let rtype = RecordType::from(u16::from(tp));
        let mut set = RrSet::new(ttl, ts, set_flags);

        for _ in 0..num_rr {
            let rdlen = read_u16(reader, "record length")?;
            let mut rdata = vec![0u8; rdlen as usize];
            reader
                .read_exact(&mut rdata)
                .map_err(|_| Error::Truncated("record data"))?;
            let record = RecordTypeWithData::from_standalone_rdata(rtype, &rdata)
                .map_err(|_| Error::Malformed("record data"))?;
            set.records.push(record);
        }

        if set.is_negative() && !set.records.is_empty() {
            return Err(Error::Malformed("negative RR set with records"));
        }

        cent.insert_rrset(rtype, set)
            .map_err(|_| Error::Malformed("RR set type"))?;
    }

    Ok(cent)
}

fn read_name(reader: &mut dyn Read, qlen: u8) -> Result<DomainName, Error> {
    let mut octets = vec![0u8; qlen as usize];
    reader
        .read_exact(&mut octets)
        .map_err(|_| Error::Truncated("entry name"))?;

    let mut labels = Vec::new();
    let mut pos = 0;
    loop {
        let len = *octets.get(pos).ok_or(Error::Malformed("entry name"))? as usize;
        pos += 1;
        if len == 0 {
            labels.push(Label::new());
            break;
        }
        let os = octets
            .get(pos..pos + len)
            .ok_or(Error::Malformed("entry name"))?;
        labels.push(Label::try_from(os).map_err(|_| Error::Malformed("entry name"))?);
        pos += len;
    }

    if pos != octets.len() {
        return Err(Error::Malformed("entry name"));
    }

    DomainName::from_labels(labels).ok_or(Error::Malformed("entry name"))
}

fn read_u8(reader: &mut dyn Read, what: &'static str) -> Result<u8, Error> {
    let mut buf = [0u8; 1];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::Truncated(what))?;
    Ok(buf[0])
}

fn read_u16(reader: &mut dyn Read, what: &'static str) -> Result<u16, Error> {
    let mut buf = [0u8; 2];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::Truncated(what))?;
    Ok(u16::from_be_bytes(buf))
}

fn read_u32(reader: &mut dyn Read, what: &'static str) -> Result<u32, Error> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::Truncated(what))?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u64(reader: &mut dyn Read, what: &'static str) -> Result<u64, Error> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|_| Error::Truncated(what))?;
    Ok(u64::from_be_bytes(buf))
}
