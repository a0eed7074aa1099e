//! MDC record codec
//!
//! Every record appended to an MDC starts with a one-byte type tag followed
//! by fixed little-endian fields (strings are length-prefixed). Framing and
//! checksums belong to the mlog layer underneath; this codec only packs and
//! unpacks the logical record.
//!
//! Record taxonomy:
//! - VERSION: metadata content version; if present it must be first
//! - MCCONFIG / MCSPARE / MPCONFIG: pool property records (MDC0 only)
//! - OCREATE / ODELETE / OERASE / OUPDATE / OIDCKPT: object records

use mpool_common::config::LABEL_MAX;
use mpool_common::{DriveParms, DriveState, Error, MediaClass, PoolConfig, Result};
use uuid::Uuid;

use crate::objid::ObjId;
use crate::version::MdccVer;

/// Maximum packed record length
pub const MAX_REC_LEN: usize = 256;

/// Record type tag, the first byte of every packed record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecType {
    Version = 1,
    McConfig = 2,
    McSpare = 3,
    MpConfig = 4,
    OCreate = 5,
    ODelete = 6,
    OErase = 7,
    OUpdate = 8,
    OidCkpt = 9,
}

impl TryFrom<u8> for RecType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecType::Version),
            2 => Ok(RecType::McConfig),
            3 => Ok(RecType::McSpare),
            4 => Ok(RecType::MpConfig),
            5 => Ok(RecType::OCreate),
            6 => Ok(RecType::ODelete),
            7 => Ok(RecType::OErase),
            8 => Ok(RecType::OUpdate),
            9 => Ok(RecType::OidCkpt),
            _ => Err(Error::corrupt(format!("unknown record type tag {value}"))),
        }
    }
}

impl RecType {
    /// Whether records of this type describe objects (vs pool properties)
    #[must_use]
    pub fn is_object(self) -> bool {
        matches!(
            self,
            RecType::OCreate
                | RecType::ODelete
                | RecType::OErase
                | RecType::OUpdate
                | RecType::OidCkpt
        )
    }
}

/// Object placement carried by OCREATE and OUPDATE records
///
/// The drive is identified by UUID on media; the replay path resolves it to
/// a drive handle against the activated drive list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutRec {
    pub objid: ObjId,
    pub gen: u64,
    pub devid: Uuid,
    pub zaddr: u64,
    pub zcnt: u32,
}

/// Drive list entry carried by MCCONFIG records
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriveRec {
    pub state: DriveState,
    pub parms: DriveParms,
}

/// A decoded MDC record
#[derive(Clone, Debug, PartialEq)]
pub enum MdcRecord {
    Version(MdccVer),
    McConfig(DriveRec),
    McSpare { class: MediaClass, spzone: u8 },
    MpConfig(PoolConfig),
    OCreate(LayoutRec),
    ODelete(ObjId),
    OErase { objid: ObjId, gen: u64 },
    OUpdate(LayoutRec),
    OidCkpt(ObjId),
}

impl MdcRecord {
    /// Type tag of this record
    #[must_use]
    pub fn rectype(&self) -> RecType {
        match self {
            MdcRecord::Version(_) => RecType::Version,
            MdcRecord::McConfig(_) => RecType::McConfig,
            MdcRecord::McSpare { .. } => RecType::McSpare,
            MdcRecord::MpConfig(_) => RecType::MpConfig,
            MdcRecord::OCreate(_) => RecType::OCreate,
            MdcRecord::ODelete(_) => RecType::ODelete,
            MdcRecord::OErase { .. } => RecType::OErase,
            MdcRecord::OUpdate(_) => RecType::OUpdate,
            MdcRecord::OidCkpt(_) => RecType::OidCkpt,
        }
    }

    /// Pack into `buf`, returning the packed length
    pub fn pack_into(&self, buf: &mut [u8]) -> Result<usize> {
        let mut w = Writer::new(buf);
        w.u8(self.rectype() as u8)?;

        match self {
            MdcRecord::Version(ver) => {
                w.u16(ver.major)?;
                w.u16(ver.minor)?;
                w.u16(ver.patch)?;
                w.u16(ver.dev)?;
            }
            MdcRecord::McConfig(rec) => {
                w.u8(rec.state as u8)?;
                w.bytes(rec.parms.devid.as_bytes())?;
                w.u8(rec.parms.class as u8)?;
                w.u32(rec.parms.zonepg)?;
                w.u32(rec.parms.sector_size)?;
                w.u8(rec.parms.devtype)?;
                w.u64(rec.parms.features)?;
                w.u64(rec.parms.zone_count)?;
                w.u64(rec.parms.devsz)?;
            }
            MdcRecord::McSpare { class, spzone } => {
                w.u8(*class as u8)?;
                w.u8(*spzone)?;
            }
            MdcRecord::MpConfig(cfg) => {
                if cfg.label.len() > LABEL_MAX {
                    return Err(Error::invalid_arg(format!(
                        "pool label longer than {LABEL_MAX} bytes"
                    )));
                }
                w.bytes(cfg.pool_id.as_bytes())?;
                w.u16(cfg.label.len() as u16)?;
                w.bytes(cfg.label.as_bytes())?;
            }
            MdcRecord::OCreate(lrec) | MdcRecord::OUpdate(lrec) => {
                w.u64(lrec.objid.as_u64())?;
                w.u64(lrec.gen)?;
                w.bytes(lrec.devid.as_bytes())?;
                w.u64(lrec.zaddr)?;
                w.u32(lrec.zcnt)?;
            }
            MdcRecord::ODelete(objid) | MdcRecord::OidCkpt(objid) => {
                w.u64(objid.as_u64())?;
            }
            MdcRecord::OErase { objid, gen } => {
                w.u64(objid.as_u64())?;
                w.u64(*gen)?;
            }
        }

        Ok(w.len())
    }

    /// Unpack a record packed by [`pack_into`](Self::pack_into)
    ///
    /// `_ver` is the content version of the containing MDC; all versions
    /// readable by this binary share one record layout.
    pub fn unpack(buf: &[u8], _ver: MdccVer) -> Result<MdcRecord> {
        let mut r = Reader::new(buf);
        let rectype = RecType::try_from(r.u8()?)?;

        let rec = match rectype {
            RecType::Version => MdcRecord::Version(MdccVer::new(
                r.u16()?,
                r.u16()?,
                r.u16()?,
                r.u16()?,
            )),
            RecType::McConfig => {
                let state = DriveState::from_repr(r.u8()?)
                    .ok_or_else(|| Error::corrupt("bad drive state in MCCONFIG"))?;
                let devid = r.uuid()?;
                let class = MediaClass::from_repr(r.u8()?)
                    .ok_or_else(|| Error::corrupt("bad media class in MCCONFIG"))?;
                MdcRecord::McConfig(DriveRec {
                    state,
                    parms: DriveParms {
                        devid,
                        class,
                        zonepg: r.u32()?,
                        sector_size: r.u32()?,
                        devtype: r.u8()?,
                        features: r.u64()?,
                        zone_count: r.u64()?,
                        devsz: r.u64()?,
                    },
                })
            }
            RecType::McSpare => {
                let class = MediaClass::from_repr(r.u8()?)
                    .ok_or_else(|| Error::corrupt("bad media class in MCSPARE"))?;
                let spzone = r.u8()?;
                if spzone > 100 {
                    return Err(Error::corrupt(format!("spare percent {spzone} > 100")));
                }
                MdcRecord::McSpare { class, spzone }
            }
            RecType::MpConfig => {
                let pool_id = r.uuid()?;
                let len = r.u16()? as usize;
                if len > LABEL_MAX {
                    return Err(Error::corrupt("pool label too long"));
                }
                let label = String::from_utf8(r.slice(len)?.to_vec())
                    .map_err(|_| Error::corrupt("pool label not utf-8"))?;
                MdcRecord::MpConfig(PoolConfig { pool_id, label })
            }
            RecType::OCreate | RecType::OUpdate => {
                let lrec = LayoutRec {
                    objid: ObjId::from_u64(r.u64()?),
                    gen: r.u64()?,
                    devid: r.uuid()?,
                    zaddr: r.u64()?,
                    zcnt: r.u32()?,
                };
                if rectype == RecType::OCreate {
                    MdcRecord::OCreate(lrec)
                } else {
                    MdcRecord::OUpdate(lrec)
                }
            }
            RecType::ODelete => MdcRecord::ODelete(ObjId::from_u64(r.u64()?)),
            RecType::OidCkpt => MdcRecord::OidCkpt(ObjId::from_u64(r.u64()?)),
            RecType::OErase => MdcRecord::OErase {
                objid: ObjId::from_u64(r.u64()?),
                gen: r.u64()?,
            },
        };

        Ok(rec)
    }
}

/// Peek the type tag of a packed record
pub fn peek_type(buf: &[u8]) -> Result<RecType> {
    let tag = buf
        .first()
        .copied()
        .ok_or_else(|| Error::corrupt("empty record"))?;
    RecType::try_from(tag)
}

/// Whether a packed record is an object record, without unpacking it
#[must_use]
pub fn is_object_record(buf: &[u8]) -> bool {
    peek_type(buf).map(RecType::is_object).unwrap_or(false)
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, src: &[u8]) -> Result<()> {
        let end = self.pos + src.len();
        if end > self.buf.len() {
            return Err(Error::invalid_arg("record buffer too small"));
        }
        self.buf[self.pos..end].copy_from_slice(src);
        self.pos = end;
        Ok(())
    }

    fn u8(&mut self, v: u8) -> Result<()> {
        self.bytes(&[v])
    }

    fn u16(&mut self, v: u16) -> Result<()> {
        self.bytes(&v.to_le_bytes())
    }

    fn u32(&mut self, v: u32) -> Result<()> {
        self.bytes(&v.to_le_bytes())
    }

    fn u64(&mut self, v: u64) -> Result<()> {
        self.bytes(&v.to_le_bytes())
    }

    fn len(&self) -> usize {
        self.pos
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn slice(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.buf.len() {
            return Err(Error::corrupt("record truncated"));
        }
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.slice(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.slice(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.slice(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.slice(8)?.try_into().unwrap()))
    }

    fn uuid(&mut self) -> Result<Uuid> {
        let raw: [u8; 16] = self.slice(16)?.try_into().unwrap();
        Ok(Uuid::from_bytes(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objid::{logid_make, ObjType};

    fn roundtrip(rec: MdcRecord) -> MdcRecord {
        let mut buf = [0u8; MAX_REC_LEN];
        let len = rec.pack_into(&mut buf).unwrap();
        assert!(len <= MAX_REC_LEN);
        MdcRecord::unpack(&buf[..len], MdccVer::LATEST).unwrap()
    }

    #[test]
    fn test_version_roundtrip() {
        let rec = MdcRecord::Version(MdccVer::LATEST);
        assert_eq!(roundtrip(rec.clone()), rec);
    }

    #[test]
    fn test_mcconfig_roundtrip() {
        let rec = MdcRecord::McConfig(DriveRec {
            state: DriveState::Active,
            parms: DriveParms {
                devid: Uuid::new_v4(),
                class: MediaClass::Capacity,
                zonepg: 256,
                sector_size: 4096,
                devtype: 2,
                features: 0x5,
                zone_count: 8192,
                devsz: 8192 * 256 * 4096,
            },
        });
        assert_eq!(roundtrip(rec.clone()), rec);
    }

    #[test]
    fn test_object_record_roundtrips() {
        let objid = ObjId::new(77, ObjType::Mblock, 3);
        let lrec = LayoutRec {
            objid,
            gen: 4,
            devid: Uuid::new_v4(),
            zaddr: 1024,
            zcnt: 3,
        };

        for rec in [
            MdcRecord::OCreate(lrec),
            MdcRecord::OUpdate(lrec),
            MdcRecord::ODelete(objid),
            MdcRecord::OErase { objid, gen: 9 },
            MdcRecord::OidCkpt(logid_make(0, 4)),
            MdcRecord::McSpare {
                class: MediaClass::Staging,
                spzone: 7,
            },
            MdcRecord::MpConfig(PoolConfig {
                pool_id: Uuid::new_v4(),
                label: "pool-a".to_string(),
            }),
        ] {
            assert_eq!(roundtrip(rec.clone()), rec);
        }
    }

    #[test]
    fn test_peek_helpers() {
        let mut buf = [0u8; MAX_REC_LEN];
        let len = MdcRecord::ODelete(ObjId::new(5, ObjType::Mlog, 1))
            .pack_into(&mut buf)
            .unwrap();
        assert_eq!(peek_type(&buf[..len]).unwrap(), RecType::ODelete);
        assert!(is_object_record(&buf[..len]));

        let len = MdcRecord::Version(MdccVer::LATEST)
            .pack_into(&mut buf)
            .unwrap();
        assert!(!is_object_record(&buf[..len]));
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        assert!(MdcRecord::unpack(&[0xff, 0, 1, 2], MdccVer::LATEST).is_err());
        assert!(MdcRecord::unpack(&[], MdccVer::LATEST).is_err());
        // truncated ODELETE
        assert!(MdcRecord::unpack(&[RecType::ODelete as u8, 1, 2], MdccVer::LATEST).is_err());
    }
}
