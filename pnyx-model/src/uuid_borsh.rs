//! Borsh adapters for `Uuid` (serialized as the raw `[u8; 16]`).

use uuid::Uuid;

pub fn serialize<W: borsh::io::Write>(uuid: &Uuid, writer: &mut W) -> borsh::io::Result<()> {
    writer.write_all(uuid.as_bytes())
}

pub fn deserialize<R: borsh::io::Read>(reader: &mut R) -> borsh::io::Result<Uuid> {
    let mut buf = [0u8; 16];
    reader.read_exact(&mut buf)?;
    Ok(Uuid::from_bytes(buf))
}

/// Vec variant: u32 length prefix (borsh convention) followed by raw uuids.
pub mod vec {
    use super::*;

    pub fn serialize<W: borsh::io::Write>(
        uuids: &Vec<Uuid>,
        writer: &mut W,
    ) -> borsh::io::Result<()> {
        let len = u32::try_from(uuids.len()).map_err(|_| {
            borsh::io::Error::new(borsh::io::ErrorKind::InvalidData, "uuid list too long")
        })?;
        writer.write_all(&len.to_le_bytes())?;
        for id in uuids {
            writer.write_all(id.as_bytes())?;
        }
        Ok(())
    }

    pub fn deserialize<R: borsh::io::Read>(reader: &mut R) -> borsh::io::Result<Vec<Uuid>> {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut out = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            out.push(super::deserialize(reader)?);
        }
        Ok(out)
    }
}
